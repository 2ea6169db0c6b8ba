mod error;
mod procedure;
mod transport;
pub mod auth;

pub use error::{AuthError, HandlerError, TransportError};
pub use procedure::{
    handler_fn, CallContext, FnHandler, HandlerResult, Options, ProcedureHandler, ProgressSink,
    ProgressUpdate, PublishOptions, RegisterOptions,
};
pub use transport::{Transport, TransportPtr};

/// Topic every error report is published on
pub const ERRORS_TOPIC: &str = "sys.errors";
