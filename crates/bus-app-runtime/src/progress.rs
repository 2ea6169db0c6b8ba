use crate::queue::TaskQueue;
use async_trait::async_trait;
use bus_app_core::{
    CallContext, ProgressSink, ProgressUpdate, PublishOptions, TransportError, TransportPtr,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where progress updates currently go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Not decided yet; resolved on the first `advance`
    Unbound,
    Remote,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    RemoteAvailable,
    RemoteUnavailable,
    SendFailed,
}

impl DispatchStrategy {
    /// Pure transition function. Local is terminal; nothing leads back to
    /// Unbound.
    pub fn transition(self, event: DispatchEvent) -> Self {
        match (self, event) {
            (DispatchStrategy::Unbound, DispatchEvent::RemoteAvailable) => DispatchStrategy::Remote,
            (DispatchStrategy::Unbound, DispatchEvent::RemoteUnavailable) => DispatchStrategy::Local,
            (DispatchStrategy::Remote, DispatchEvent::SendFailed) => DispatchStrategy::Local,
            (state, _) => state,
        }
    }
}

/// Writes progress to the process log
pub struct ConsoleSink;

#[async_trait]
impl ProgressSink for ConsoleSink {
    async fn send(&self, update: &ProgressUpdate) -> Result<(), TransportError> {
        info!(step = update.step, total = ?update.total, "Progress {}", update);
        Ok(())
    }
}

struct TopicPublisher {
    queue: TaskQueue,
    transport: TransportPtr,
    topic: String,
}

/// Step-by-step progress for one invocation. The first `advance` picks the
/// caller's progress channel when there is one, the local sink otherwise. A
/// failed remote send moves to local output for good, and the failed update
/// is delivered locally.
pub struct ProgressReporter {
    strategy: DispatchStrategy,
    step: u32,
    total: Option<u32>,
    remote: Option<Arc<dyn ProgressSink>>,
    local: Arc<dyn ProgressSink>,
    publisher: Option<TopicPublisher>,
}

impl ProgressReporter {
    /// Reporter for the invocation described by `ctx`
    pub fn new(ctx: &CallContext) -> Self {
        ProgressReporter {
            strategy: DispatchStrategy::Unbound,
            step: 0,
            total: None,
            remote: ctx.progress.clone(),
            local: Arc::new(ConsoleSink),
            publisher: None,
        }
    }

    pub fn with_total(mut self, total: u32) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_local_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.local = sink;
        self
    }

    /// Also publish every successful remote update on `topic`
    pub fn publish_to(
        mut self,
        queue: TaskQueue,
        transport: TransportPtr,
        topic: impl Into<String>,
    ) -> Self {
        self.publisher = Some(TopicPublisher {
            queue,
            transport,
            topic: topic.into(),
        });
        self
    }

    pub fn set_total(&mut self, total: Option<u32>) {
        self.total = total;
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn total(&self) -> Option<u32> {
        self.total
    }

    /// Report the current step and move to the next one
    pub async fn advance(&mut self, step_name: Option<&str>) {
        self.resolve();

        let update = ProgressUpdate::new(self.step, self.total, step_name.map(str::to_string));

        if self.strategy == DispatchStrategy::Remote {
            match self.send_remote(&update).await {
                Ok(()) => self.publish(&update),
                Err(e) => {
                    warn!("Remote progress failed, switching to local output: {}", e);
                    self.strategy = self.strategy.transition(DispatchEvent::SendFailed);
                    self.send_local(&update).await;
                }
            }
        } else {
            self.send_local(&update).await;
        }

        self.step += 1;
    }

    /// Report a final step at index 0 and leave the reporter reset
    pub async fn finish(&mut self, step_name: Option<&str>) {
        self.step = 0;
        self.advance(step_name).await;
        self.step = 0;
    }

    fn resolve(&mut self) {
        if self.strategy != DispatchStrategy::Unbound {
            return;
        }

        let event = if self.remote.is_some() {
            DispatchEvent::RemoteAvailable
        } else {
            DispatchEvent::RemoteUnavailable
        };
        self.strategy = self.strategy.transition(event);
        debug!("Progress reporter bound to {:?}", self.strategy);
    }

    async fn send_remote(&self, update: &ProgressUpdate) -> Result<(), TransportError> {
        match &self.remote {
            Some(sink) => sink.send(update).await,
            None => Err(TransportError::Closed),
        }
    }

    async fn send_local(&self, update: &ProgressUpdate) {
        if let Err(e) = self.local.send(update).await {
            warn!("Local progress output failed: {}", e);
        }
    }

    fn publish(&self, update: &ProgressUpdate) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let transport = publisher.transport.clone();
        let topic = publisher.topic.clone();
        let payload = update.to_value();

        let submitted = publisher
            .queue
            .submit_quiet(format!("publish {}", topic), async move {
                transport
                    .publish(&topic, payload, &PublishOptions::new())
                    .await?;
                Ok(())
            });

        if let Err(e) = submitted {
            debug!("Could not queue progress publish: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BlockingExecutor;
    use crate::queue::task_queue;
    use crate::transport::{LoopbackBroker, ProgressRecorder};

    fn reporter(remote: Option<Arc<ProgressRecorder>>, local: &Arc<ProgressRecorder>) -> ProgressReporter {
        let mut ctx = CallContext::new("long.job");
        if let Some(remote) = remote {
            ctx = ctx.with_progress(remote);
        }
        ProgressReporter::new(&ctx).with_local_sink(local.clone())
    }

    #[test]
    fn test_transitions() {
        use DispatchEvent::*;
        use DispatchStrategy::*;

        assert_eq!(Unbound.transition(RemoteAvailable), Remote);
        assert_eq!(Unbound.transition(RemoteUnavailable), Local);
        assert_eq!(Unbound.transition(SendFailed), Unbound);
        assert_eq!(Remote.transition(SendFailed), Local);
        assert_eq!(Remote.transition(RemoteUnavailable), Remote);

        for event in [RemoteAvailable, RemoteUnavailable, SendFailed] {
            assert_eq!(Local.transition(event), Local);
        }
    }

    #[tokio::test]
    async fn test_binds_local_without_remote() {
        let local = Arc::new(ProgressRecorder::new());
        let mut progress = reporter(None, &local);
        assert_eq!(progress.strategy(), DispatchStrategy::Unbound);

        progress.advance(Some("load")).await;
        progress.advance(None).await;

        assert_eq!(progress.strategy(), DispatchStrategy::Local);
        assert_eq!(
            local.updates(),
            vec![
                ProgressUpdate::new(0, None, Some("load".into())),
                ProgressUpdate::new(1, None, None),
            ]
        );
        assert_eq!(progress.step(), 2);
    }

    #[tokio::test]
    async fn test_remote_path_with_total() {
        let remote = Arc::new(ProgressRecorder::new());
        let local = Arc::new(ProgressRecorder::new());
        let mut progress = reporter(Some(remote.clone()), &local).with_total(3);

        progress.advance(Some("fetch")).await;

        assert_eq!(progress.strategy(), DispatchStrategy::Remote);
        assert_eq!(
            remote.updates(),
            vec![ProgressUpdate::new(0, Some(3), Some("fetch".into()))]
        );
        assert!(local.updates().is_empty());
    }

    #[tokio::test]
    async fn test_failed_remote_falls_back_for_good() {
        let remote = Arc::new(ProgressRecorder::new());
        let local = Arc::new(ProgressRecorder::new());
        let mut progress = reporter(Some(remote.clone()), &local);

        progress.advance(Some("one")).await;
        remote.fail(true);
        progress.advance(Some("two")).await;

        assert_eq!(progress.strategy(), DispatchStrategy::Local);
        // Exactly one local report for the call that failed remotely
        assert_eq!(
            local.updates(),
            vec![ProgressUpdate::new(1, None, Some("two".into()))]
        );

        // Even once the remote side recovers it is never used again
        remote.fail(false);
        progress.advance(Some("three")).await;

        assert_eq!(remote.attempts(), 2);
        assert_eq!(remote.updates().len(), 1);
        assert_eq!(local.updates().len(), 2);
        assert_eq!(progress.step(), 3);
    }

    #[tokio::test]
    async fn test_finish_resets_step() {
        let local = Arc::new(ProgressRecorder::new());
        let mut progress = reporter(None, &local);

        for _ in 0..4 {
            progress.advance(None).await;
        }
        assert_eq!(progress.step(), 4);

        progress.finish(Some("done")).await;

        assert_eq!(progress.step(), 0);
        assert_eq!(
            local.updates().last(),
            Some(&ProgressUpdate::new(0, None, Some("done".into())))
        );
        assert_eq!(local.updates().len(), 5);
    }

    #[tokio::test]
    async fn test_remote_success_is_republished() {
        let broker = Arc::new(LoopbackBroker::new());
        let (queue, mut receiver) = task_queue(BlockingExecutor::new(1));
        let remote = Arc::new(ProgressRecorder::new());
        let local = Arc::new(ProgressRecorder::new());

        let mut progress = reporter(Some(remote.clone()), &local)
            .with_total(2)
            .publish_to(queue, broker.clone(), "jobs.progress");

        progress.advance(Some("parse")).await;

        let task = receiver.try_recv().expect("publish queued");
        assert!(!task.reports_failures());
        task.run().await.unwrap();

        assert_eq!(
            broker.published_on("jobs.progress"),
            vec![serde_json::json!([0, 2, "parse"])]
        );
    }

    #[tokio::test]
    async fn test_failed_remote_is_not_republished() {
        let broker = Arc::new(LoopbackBroker::new());
        let (queue, mut receiver) = task_queue(BlockingExecutor::new(1));
        let remote = Arc::new(ProgressRecorder::new());
        remote.fail(true);
        let local = Arc::new(ProgressRecorder::new());

        let mut progress = reporter(Some(remote), &local).publish_to(
            queue,
            broker.clone(),
            "jobs.progress",
        );

        progress.advance(None).await;

        assert!(receiver.try_recv().is_none());
        assert_eq!(local.updates().len(), 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_console_sink_logs_each_update_once() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        ConsoleSink
            .send(&ProgressUpdate::new(2, Some(5), Some("copying".into())))
            .await
            .unwrap();

        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        assert_eq!(output.matches("[2/5] copying").count(), 1, "{}", output);
    }
}
