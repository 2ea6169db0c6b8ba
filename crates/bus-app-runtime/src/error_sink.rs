use crate::executor::PanicTrace;
use crate::queue::TaskQueue;
use bus_app_core::{PublishOptions, TransportPtr, ERRORS_TOPIC};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

/// What went wrong inside a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task returned an error
    Error,
    /// The task panicked
    Panic,
    /// The task was cancelled before it finished
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context extracted from a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: FailureKind,
    pub message: String,
    /// Task label plus the source location it was submitted from
    pub origin: String,
    /// Full error chain, with a backtrace when one was captured
    pub trace: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(
        kind: FailureKind,
        origin: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        ErrorReport {
            kind,
            message: message.into(),
            origin: origin.into(),
            trace: trace.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn from_error(origin: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(
            FailureKind::Error,
            origin,
            format!("{:#}", err),
            format!("{:?}", err),
        )
    }

    pub fn panic(
        origin: impl Into<String>,
        message: impl Into<String>,
        panic_trace: Option<PanicTrace>,
    ) -> Self {
        let message = message.into();
        let trace = match panic_trace {
            Some(PanicTrace {
                location,
                backtrace: Some(backtrace),
            }) => format!("panicked at {}: {}\n{}", location, message, backtrace),
            Some(PanicTrace { location, .. }) => format!("panicked at {}: {}", location, message),
            None => format!("panicked: {}", message),
        };
        Self::new(FailureKind::Panic, origin, message, trace)
    }

    pub fn cancelled(origin: impl Into<String>) -> Self {
        Self::new(
            FailureKind::Cancelled,
            origin,
            "task was cancelled",
            "task was cancelled",
        )
    }

    /// Single log-friendly line
    pub fn formatted(&self) -> String {
        format!("[{}] {} at {}", self.kind, self.message, self.origin)
    }
}

/// Logs failures and forwards them to the `sys.errors` topic.
#[derive(Clone)]
pub struct ErrorSink {
    queue: TaskQueue,
    transport: TransportPtr,
    app_name: Option<String>,
    instance_id: String,
}

impl ErrorSink {
    pub fn new(
        queue: TaskQueue,
        transport: TransportPtr,
        app_name: Option<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        ErrorSink {
            queue,
            transport,
            app_name,
            instance_id: instance_id.into(),
        }
    }

    /// Record `report`. The log line is written synchronously; the publish
    /// goes through the task queue as a quiet task so a failing publish is
    /// never reported again.
    pub fn report(&self, report: &ErrorReport) {
        error!(
            kind = %report.kind,
            origin = %report.origin,
            "{}\n{}",
            report.message,
            report.trace
        );

        let payload = serde_json::json!({
            "kind": report.kind,
            "message": report.formatted(),
            "origin": report.origin,
            "trace": report.trace,
            "app_name": self.app_name,
            "instance_id": self.instance_id,
            "occurred_at": report.occurred_at,
        });

        let transport = self.transport.clone();
        let submitted = self.queue.submit_quiet(format!("publish {}", ERRORS_TOPIC), async move {
            transport
                .publish(ERRORS_TOPIC, payload, &PublishOptions::new())
                .await?;
            Ok(())
        });

        if let Err(e) = submitted {
            warn!("Could not queue error report: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BlockingExecutor;
    use crate::queue::task_queue;
    use crate::transport::LoopbackBroker;
    use std::sync::Arc;

    #[test]
    fn test_report_from_error_chain() {
        let err = anyhow::anyhow!("connection refused").context("publishing status");
        let report = ErrorReport::from_error("status (src/app.rs:10)", &err);

        assert_eq!(report.kind, FailureKind::Error);
        assert_eq!(report.message, "publishing status: connection refused");
        assert!(report.trace.contains("Caused by"));
        assert_eq!(
            report.formatted(),
            "[error] publishing status: connection refused at status (src/app.rs:10)"
        );
    }

    #[test]
    fn test_panic_report_trace() {
        let located = ErrorReport::panic(
            "resize (src/app.rs:4)",
            "index out of bounds",
            Some(PanicTrace {
                location: "src/app.rs:12:9".into(),
                backtrace: Some("   0: app::resize".into()),
            }),
        );
        assert_eq!(located.kind, FailureKind::Panic);
        assert_eq!(
            located.trace,
            "panicked at src/app.rs:12:9: index out of bounds\n   0: app::resize"
        );

        let bare = ErrorReport::panic("resize (src/app.rs:4)", "index out of bounds", None);
        assert_eq!(bare.trace, "panicked: index out of bounds");
    }

    #[tokio::test]
    async fn test_report_enqueues_quiet_publish() {
        let broker = Arc::new(LoopbackBroker::new());
        let (queue, mut receiver) = task_queue(BlockingExecutor::new(1));
        let sink = ErrorSink::new(queue, broker.clone(), Some("indexer".into()), "host-1-abc");

        sink.report(&ErrorReport::panic("worker (src/lib.rs:1)", "boom", None));

        let task = receiver.try_recv().expect("publish task queued");
        assert!(!task.reports_failures());
        assert_eq!(task.label(), "publish sys.errors");

        task.run().await.unwrap();

        let published = broker.published_on(ERRORS_TOPIC);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["kind"], "panic");
        assert_eq!(published[0]["app_name"], "indexer");
        assert_eq!(published[0]["instance_id"], "host-1-abc");
        assert_eq!(published[0]["message"], "[panic] boom at worker (src/lib.rs:1)");
    }

    #[tokio::test]
    async fn test_failed_publish_surfaces_as_task_error() {
        let broker = Arc::new(LoopbackBroker::new());
        broker.fail_publishes(true);
        let (queue, mut receiver) = task_queue(BlockingExecutor::new(1));
        let sink = ErrorSink::new(queue, broker.clone(), None, "host-1-abc");

        sink.report(&ErrorReport::cancelled("slow (src/lib.rs:2)"));

        let task = receiver.try_recv().unwrap();
        assert!(task.run().await.is_err());
        assert!(broker.published_on(ERRORS_TOPIC).is_empty());
        // Nothing else was queued in response
        assert!(receiver.try_recv().is_none());
    }
}
