use crate::executor::BlockingExecutor;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Future produced by a task once it is dequeued
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

type Action = Box<dyn FnOnce() -> TaskFuture + Send>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task queue is closed, dropped task {0}")]
    Closed(String),
}

/// A deferred unit of work.
///
/// Nothing runs until the processor dequeues the task and invokes it.
pub struct Task {
    label: String,
    origin: &'static Location<'static>,
    report_failures: bool,
    action: Action,
}

impl Task {
    /// Create a task from a closure producing the work's future.
    #[track_caller]
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Task {
            label: label.into(),
            origin: Location::caller(),
            report_failures: true,
            action: Box::new(move || f().boxed()),
        }
    }

    /// Failures of a quiet task are logged but never sent to the error sink
    pub fn quiet(mut self) -> Self {
        self.report_failures = false;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Source location the task was submitted from
    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    pub fn call_site(&self) -> String {
        format!("{}:{}", self.origin.file(), self.origin.line())
    }

    pub fn reports_failures(&self) -> bool {
        self.report_failures
    }

    /// Start the work
    pub fn run(self) -> TaskFuture {
        (self.action)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("origin", &self.call_site())
            .field("report_failures", &self.report_failures)
            .finish()
    }
}

/// Create a connected producer/consumer pair.
pub fn task_queue(executor: BlockingExecutor) -> (TaskQueue, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let queue = TaskQueue {
        tx,
        pending: pending.clone(),
        submitted: Arc::new(AtomicU64::new(0)),
        executor,
    };
    let receiver = TaskReceiver { rx, pending };

    (queue, receiver)
}

/// Producer side of the ordered, unbounded task queue.
///
/// Cheap to clone; every clone feeds the same single consumer.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    pending: Arc<AtomicUsize>,
    submitted: Arc<AtomicU64>,
    executor: BlockingExecutor,
}

impl TaskQueue {
    /// Enqueue an already built task
    pub fn push(&self, task: Task) -> Result<(), QueueError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.tx.send(task).map_err(|rejected| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            QueueError::Closed(rejected.0.label)
        })
    }

    /// Enqueue a future; it is not polled before the processor reaches it.
    #[track_caller]
    pub fn submit<Fut>(&self, label: impl Into<String>, fut: Fut) -> Result<(), QueueError>
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(Task::new(label, move || fut))
    }

    /// Enqueue a closure that builds the future when the task is dequeued
    #[track_caller]
    pub fn submit_fn<F, Fut>(&self, label: impl Into<String>, f: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(Task::new(label, f))
    }

    /// Like [`TaskQueue::submit`], but failures are only logged
    #[track_caller]
    pub fn submit_quiet<Fut>(&self, label: impl Into<String>, fut: Fut) -> Result<(), QueueError>
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(Task::new(label, move || fut).quiet())
    }

    /// Enqueue blocking work. The body runs on the blocking pool while the
    /// processor waits for it, so ordering is kept without tying up the
    /// consumer thread.
    #[track_caller]
    pub fn submit_blocking<F>(&self, label: impl Into<String>, f: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let executor = self.executor.clone();
        self.push(Task::new(label, move || async move { executor.run(f).await? }))
    }

    /// Number of tasks waiting to be processed
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks accepted since the queue was created
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn executor(&self) -> &BlockingExecutor {
        &self.executor
    }
}

/// Consumer side. Exactly one exists per queue.
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
    pending: Arc<AtomicUsize>,
}

impl TaskReceiver {
    /// Wait for the next task. Returns `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Task> {
        let task = self.rx.recv().await;
        if task.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    /// Take the next task without waiting
    pub fn try_recv(&mut self) -> Option<Task> {
        let task = self.rx.try_recv().ok();
        if task.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
