use crate::{HandlerError, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Free-form option mapping passed through to the broker.
///
/// Used for both registration (`invoke`, `match`, ...) and publication
/// (`acknowledge`, `exclude_me`, ...). The core never interprets the keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, Value>);

pub type RegisterOptions = Options;
pub type PublishOptions = Options;

impl Options {
    pub fn new() -> Self {
        Options(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// One progress tuple: `(step, total, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub step: u32,
    pub total: Option<u32>,
    pub name: Option<String>,
}

impl ProgressUpdate {
    pub fn new(step: u32, total: Option<u32>, name: Option<String>) -> Self {
        ProgressUpdate { step, total, name }
    }

    /// Positional form, as progressive call results carry it on the wire
    pub fn to_value(&self) -> Value {
        serde_json::json!([self.step, self.total, self.name])
    }
}

impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "[{}/{}]", self.step, total)?,
            None => write!(f, "[{}]", self.step)?,
        }
        if let Some(name) = &self.name {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}

/// Destination for progress updates.
///
/// A remote sink forwards progressive results to the caller of the current
/// invocation; a local sink writes them somewhere on this side.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send(&self, update: &ProgressUpdate) -> Result<(), TransportError>;
}

/// Per-invocation details handed to a procedure handler by the transport.
#[derive(Clone, Default)]
pub struct CallContext {
    /// Decorated name the invocation arrived on
    pub procedure: String,
    /// Session id of the caller, when the broker discloses it
    pub caller: Option<String>,
    /// Present only when the caller asked for progressive results
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl CallContext {
    pub fn new(procedure: impl Into<String>) -> Self {
        CallContext {
            procedure: procedure.into(),
            caller: None,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Whether a remote progress channel is available for this call
    pub fn has_progress(&self) -> bool {
        self.progress.is_some()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("procedure", &self.procedure)
            .field("caller", &self.caller)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Result type for procedure handlers
pub type HandlerResult = Result<Value, HandlerError>;

/// A remotely callable procedure
#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: CallContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`ProcedureHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ProcedureHandler for FnHandler<F>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, args: Value, ctx: CallContext) -> HandlerResult {
        (self.f)(args, ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ProcedureHandler>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = Options::new()
            .with("invoke", "roundrobin")
            .with("match", "prefix");

        assert_eq!(options.len(), 2);
        assert_eq!(options.get("invoke"), Some(&Value::from("roundrobin")));
        assert!(Options::default().is_empty());
    }

    #[test]
    fn test_options_serialize_as_plain_map() {
        let options = Options::new().with("acknowledge", true);
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json, serde_json::json!({"acknowledge": true}));
    }

    #[test]
    fn test_progress_update_display() {
        let update = ProgressUpdate::new(2, Some(5), Some("indexing".to_string()));
        assert_eq!(update.to_string(), "[2/5] indexing");

        let bare = ProgressUpdate::new(0, None, None);
        assert_eq!(bare.to_string(), "[0]");
        assert_eq!(bare.to_value(), serde_json::json!([0, null, null]));
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|args: Value, _ctx| async move {
            let n = args.as_i64().ok_or_else(|| {
                HandlerError::InvalidArguments("expected integer".to_string())
            })?;
            Ok(Value::from(n * 2))
        });

        let result = handler
            .call(Value::from(21), CallContext::new("double"))
            .await
            .unwrap();
        assert_eq!(result, Value::from(42));

        let err = handler
            .call(Value::from("x"), CallContext::new("double"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArguments(_)));
    }
}
