use crate::{ProcedureHandler, PublishOptions, RegisterOptions, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// The three capabilities the runtime needs from a broker session.
///
/// Connection, authentication and the wire codec stay with whoever
/// implements this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register `handler` under the (already decorated) procedure `name`.
    async fn register(
        &self,
        name: &str,
        handler: Arc<dyn ProcedureHandler>,
        options: &RegisterOptions,
    ) -> Result<(), TransportError>;

    /// Fire-and-forget publication on `topic`.
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        options: &PublishOptions,
    ) -> Result<(), TransportError>;

    /// Invoke a remote procedure and wait for its result.
    async fn call(&self, procedure: &str, args: Value) -> Result<Value, TransportError>;
}

pub type TransportPtr = Arc<dyn Transport>;
