use thiserror::Error;

/// Errors surfaced by a [`Transport`](crate::Transport) capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker rejected the request with an application-level error
    /// (e.g. `wamp.error.procedure_already_exists`).
    #[error("Application error {error}: {message}")]
    Application { error: String, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn application(error: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::Application {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Application errors are the only kind a registration batch retries on.
    pub fn is_application(&self) -> bool {
        matches!(self, TransportError::Application { .. })
    }
}

/// Error returned by a procedure handler back to the remote caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{error}: {message}")]
    Application { error: String, message: String },

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Authentication challenge failures. Always fatal for the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid authmethod {0}")]
    UnsupportedMethod(String),

    #[error("Challenge for {0} carries no nonce")]
    MissingChallenge(String),

    #[error("No secret configured for principal")]
    MissingSecret,
}
