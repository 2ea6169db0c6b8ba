pub mod config;
pub mod context;
pub mod demo;
pub mod error_sink;
pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod machine;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod registration;
pub mod session;
pub mod transport;

pub use config::{AppConfig, ConfigError};
pub use context::AppContext;
pub use error_sink::{ErrorReport, ErrorSink, FailureKind};
pub use executor::{install_panic_hook, BlockingExecutor, ExecutorError, PanicTrace};
pub use handler::{ProcedureDescriptor, ProcedureRegistry, RegistryError};
pub use heartbeat::HeartbeatEmitter;
pub use machine::MachineStats;
pub use processor::{ProcessorHandle, TaskQueueProcessor, HEARTBEAT_THRESHOLD};
pub use progress::{DispatchStrategy, ProgressReporter};
pub use queue::{task_queue, QueueError, Task, TaskQueue, TaskReceiver};
pub use registration::{
    RegistrationError, RegistrationManager, REGISTRATION_ATTEMPTS, REGISTRATION_BACKOFF,
};
pub use session::{Application, ExitStatus, JoinOutcome, JoinRequest, Session};
pub use transport::{LoopbackBroker, ProgressRecorder};
