use crate::error_sink::{ErrorReport, ErrorSink};
use crate::executor::{install_panic_hook, panic_message, take_panic_trace};
use crate::heartbeat::HeartbeatEmitter;
use crate::queue::{Task, TaskQueue, TaskReceiver};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A heartbeat is queued once more than this many tasks ran since the last one
pub const HEARTBEAT_THRESHOLD: u32 = 4;

/// Pause before the supervisor restarts a crashed drain loop
pub const SUPERVISOR_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Single consumer of the task queue
pub struct TaskQueueProcessor {
    receiver: Mutex<TaskReceiver>,
    queue: TaskQueue,
    heartbeat: HeartbeatEmitter,
    errors: ErrorSink,
    processed: Arc<AtomicU64>,
    since_heartbeat: AtomicU32,
    restart_delay: Duration,
}

impl TaskQueueProcessor {
    pub fn new(
        receiver: TaskReceiver,
        queue: TaskQueue,
        heartbeat: HeartbeatEmitter,
        errors: ErrorSink,
    ) -> Self {
        install_panic_hook();
        TaskQueueProcessor {
            receiver: Mutex::new(receiver),
            queue,
            heartbeat,
            errors,
            processed: Arc::new(AtomicU64::new(0)),
            since_heartbeat: AtomicU32::new(0),
            restart_delay: SUPERVISOR_RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Tasks processed since the last heartbeat
    pub fn since_heartbeat(&self) -> u32 {
        self.since_heartbeat.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Start consuming in the background
    pub fn spawn(self) -> ProcessorHandle {
        let processed = self.processed.clone();
        let processor = Arc::new(self);
        let join = tokio::spawn(async move { processor.run().await });

        ProcessorHandle { join, processed }
    }

    /// Consume tasks, restarting the drain loop if it ever crashes. The
    /// processor keeps a producer handle for heartbeats, so this only
    /// returns once the channel is closed from the receiving side.
    pub async fn run(&self) {
        info!("Task queue processor started");
        let this = self;
        supervise("task queue processor", self.restart_delay, &self.errors, move || {
            this.drain()
        })
        .await;
        info!("Task queue closed, processor stopped");
    }

    async fn drain(&self) {
        let mut receiver = self.receiver.lock().await;

        while let Some(task) = receiver.recv().await {
            self.execute(task).await;
            // Any heartbeat is queued before the task counts as processed
            self.tick();
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Count one processed task and queue a heartbeat when due
    fn tick(&self) {
        let count = self.since_heartbeat.fetch_add(1, Ordering::SeqCst) + 1;
        if count > HEARTBEAT_THRESHOLD {
            self.heartbeat.send_health_check_signal(&self.queue);
            self.since_heartbeat.store(0, Ordering::SeqCst);
        }
    }

    /// Run one task on its own tokio task so a panic stays contained, and
    /// wait for it before moving on. The unwind is caught on the thread that
    /// panicked so the hook's trace can be picked up.
    async fn execute(&self, task: Task) {
        let origin = format!("{} ({})", task.label(), task.call_site());
        let report_failures = task.reports_failures();

        debug!("Executing task {}", origin);

        let task_origin = origin.clone();
        let outcome = tokio::spawn(async move {
            match AssertUnwindSafe(task.run()).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(ErrorReport::from_error(task_origin, &e)),
                Err(payload) => Some(ErrorReport::panic(
                    task_origin,
                    panic_message(payload),
                    take_panic_trace(),
                )),
            }
        })
        .await;

        let report = match outcome {
            Ok(None) => return,
            Ok(Some(report)) => report,
            Err(e) if e.is_panic() => ErrorReport::panic(origin, panic_message(e.into_panic()), None),
            Err(_) => ErrorReport::cancelled(origin),
        };

        if report_failures {
            self.errors.report(&report);
        } else {
            warn!("Task {} failed: {}", report.origin, report.message);
        }
    }
}

/// Keep `make`'s future running: a panic escaping it is logged, reported,
/// and followed by a restart after `delay`. Returns when the future finishes
/// normally.
pub async fn supervise<F, Fut>(label: &str, delay: Duration, errors: &ErrorSink, mut make: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    install_panic_hook();
    loop {
        match AssertUnwindSafe(make()).catch_unwind().await {
            Ok(()) => return,
            Err(payload) => {
                let trace = take_panic_trace();
                let message = panic_message(payload);
                error!("{} crashed: {}, restarting in {:?}", label, message, delay);
                errors.report(&ErrorReport::panic(label, message, trace));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Handle to a running processor
pub struct ProcessorHandle {
    join: JoinHandle<()>,
    processed: Arc<AtomicU64>,
}

impl ProcessorHandle {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop consuming; pending tasks are dropped
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Wait for the processor to stop on its own
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            if e.is_panic() {
                error!("Task queue processor panicked: {}", panic_message(e.into_panic()));
            }
        }
    }
}
