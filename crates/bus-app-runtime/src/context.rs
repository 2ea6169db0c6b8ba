use crate::config::AppConfig;
use crate::error_sink::{ErrorReport, ErrorSink};
use crate::executor::ExecutorError;
use crate::machine::MachineStats;
use crate::progress::ProgressReporter;
use crate::queue::{QueueError, TaskQueue};
use bus_app_core::{CallContext, PublishOptions, TransportError, TransportPtr};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Handle application code uses to reach the runtime.
///
/// Cheap to clone. Everything that publishes goes through the task queue;
/// only `call` talks to the transport directly.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: AppConfig,
    instance_id: String,
    queue: TaskQueue,
    transport: TransportPtr,
    errors: ErrorSink,
    machine: MachineStats,
}

impl AppContext {
    pub fn new(config: AppConfig, queue: TaskQueue, transport: TransportPtr, errors: ErrorSink) -> Self {
        let instance_id = config.instance_id();
        AppContext {
            inner: Arc::new(ContextInner {
                config,
                instance_id,
                queue,
                transport,
                errors,
                machine: MachineStats::new(),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn machine(&self) -> &MachineStats {
        &self.inner.machine
    }

    /// Queue background work behind everything already submitted
    #[track_caller]
    pub fn submit<Fut>(&self, label: impl Into<String>, fut: Fut) -> Result<(), QueueError>
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.queue.submit(label, fut)
    }

    #[track_caller]
    pub fn submit_fn<F, Fut>(&self, label: impl Into<String>, f: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.queue.submit_fn(label, f)
    }

    #[track_caller]
    pub fn submit_blocking<F>(&self, label: impl Into<String>, f: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.queue.submit_blocking(label, f)
    }

    /// Queue a publication on `topic`
    #[track_caller]
    pub fn publish(&self, topic: impl Into<String>, payload: Value) -> Result<(), QueueError> {
        self.publish_with(topic, payload, PublishOptions::new())
    }

    #[track_caller]
    pub fn publish_with(
        &self,
        topic: impl Into<String>,
        payload: Value,
        options: PublishOptions,
    ) -> Result<(), QueueError> {
        let topic = topic.into();
        let transport = self.inner.transport.clone();
        self.inner.queue.submit(format!("publish {}", topic), async move {
            transport.publish(&topic, payload, &options).await?;
            Ok(())
        })
    }

    /// Call a remote procedure right away, bypassing the queue
    pub async fn call(&self, procedure: &str, args: Value) -> Result<Value, TransportError> {
        self.inner.transport.call(procedure, args).await
    }

    /// Run blocking work on the bounded blocking pool
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, ExecutorError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.queue.executor().run(f).await
    }

    /// Progress reporter for one invocation. Remote updates are mirrored on
    /// the configured progress topic, if any.
    pub fn progress(&self, call: &CallContext) -> ProgressReporter {
        let reporter = ProgressReporter::new(call);
        match &self.inner.config.progress_topic {
            Some(topic) => reporter.publish_to(
                self.inner.queue.clone(),
                self.inner.transport.clone(),
                topic.clone(),
            ),
            None => reporter,
        }
    }

    /// Log `err` and forward it to the error topic
    pub fn report_error(&self, origin: impl Into<String>, err: &anyhow::Error) {
        self.inner.errors.report(&ErrorReport::from_error(origin, err));
    }
}
