use once_cell::sync::Lazy;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Blocking work panicked: {0}")]
    Panicked(String),

    #[error("Blocking work was cancelled")]
    Cancelled,

    #[error("Blocking executor is shut down")]
    Closed,
}

/// Runs blocking or CPU-bound closures on tokio's blocking pool.
///
/// At most `max_threads` closures run at the same time; further calls wait
/// for a permit instead of growing the pool.
#[derive(Clone, Debug)]
pub struct BlockingExecutor {
    permits: Arc<Semaphore>,
    max_threads: usize,
}

impl BlockingExecutor {
    pub fn new(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        BlockingExecutor {
            permits: Arc::new(Semaphore::new(max_threads)),
            max_threads,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Execute `f` off the async threads and wait for its result
    pub async fn run<F, R>(&self, f: F) -> Result<R, ExecutorError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Closed)?;

        debug!(
            "Dispatching blocking work ({} of {} slots free)",
            self.permits.available_permits(),
            self.max_threads
        );

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match handle.await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    error!("Blocking work panicked: {}", message);
                    Err(ExecutorError::Panicked(message))
                } else {
                    error!("Blocking work was cancelled");
                    Err(ExecutorError::Cancelled)
                }
            }
        }
    }
}

/// Where a panic happened, as seen by the panic hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicTrace {
    pub location: String,
    /// Present only when backtraces are enabled (`RUST_BACKTRACE`)
    pub backtrace: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicTrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Lazy<()> = Lazy::new(|| {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown location".to_string());
        let backtrace = Backtrace::capture();
        let backtrace = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };
        LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(PanicTrace { location, backtrace }));
        previous(info);
    }));
});

/// Chain a hook that remembers the last panic on each thread. The previous
/// hook keeps running. Safe to call any number of times.
pub fn install_panic_hook() {
    Lazy::force(&PANIC_HOOK);
}

/// Take the trace of the last panic on this thread. Must be called on the
/// thread that caught the unwind, before yielding.
pub(crate) fn take_panic_trace() -> Option<PanicTrace> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
