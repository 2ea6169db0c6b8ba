use async_trait::async_trait;
use bus_app_core::{
    CallContext, HandlerError, ProcedureHandler, ProgressSink, ProgressUpdate, PublishOptions,
    RegisterOptions, Transport, TransportError,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const PROCEDURE_ALREADY_EXISTS: &str = "wamp.error.procedure_already_exists";
pub const NO_SUCH_PROCEDURE: &str = "wamp.error.no_such_procedure";
pub const INVALID_ARGUMENT: &str = "wamp.error.invalid_argument";
pub const RUNTIME_ERROR: &str = "wamp.error.runtime_error";

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Value,
    pub options: PublishOptions,
}

struct Registration {
    handler: Arc<dyn ProcedureHandler>,
    options: RegisterOptions,
}

/// In-process broker routing `call` straight to the registered handler.
/// Registering a name again replaces its handler. Failures can be scripted.
#[derive(Default)]
pub struct LoopbackBroker {
    registrations: DashMap<String, Registration>,
    register_log: Mutex<Vec<String>>,
    /// One entry per upcoming register call; `None` lets the call through
    register_script: Mutex<VecDeque<Option<TransportError>>>,
    register_attempts: AtomicUsize,
    published: Mutex<Vec<Publication>>,
    fail_publishes: AtomicBool,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` register calls as if the name were taken
    pub fn reject_next_registrations(&self, n: usize) {
        let mut script = self.register_script.lock();
        for _ in 0..n {
            script.push_back(Some(TransportError::application(
                PROCEDURE_ALREADY_EXISTS,
                "register for already registered procedure",
            )));
        }
    }

    /// Let the next `n` register calls through before any scripted failure
    pub fn allow_next_registrations(&self, n: usize) {
        let mut script = self.register_script.lock();
        for _ in 0..n {
            script.push_back(None);
        }
    }

    /// Fail the next register call with `err`
    pub fn fail_registration_with(&self, err: TransportError) {
        self.register_script.lock().push_back(Some(err));
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Register calls seen so far, including rejected ones
    pub fn register_attempts(&self) -> usize {
        self.register_attempts.load(Ordering::SeqCst)
    }

    /// Names accepted so far, in the order they were registered
    pub fn registered(&self) -> Vec<String> {
        self.register_log.lock().clone()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn registration_options(&self, name: &str) -> Option<RegisterOptions> {
        self.registrations.get(name).map(|r| r.options.clone())
    }

    /// Every publication, oldest first
    pub fn publications(&self) -> Vec<Publication> {
        self.published.lock().clone()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .iter()
            .map(|p| (p.topic.clone(), p.payload.clone()))
            .collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    /// Call `procedure` asking for progressive results delivered to `sink`
    pub async fn call_with_progress(
        &self,
        procedure: &str,
        args: Value,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Value, TransportError> {
        let ctx = CallContext::new(procedure).with_progress(sink);
        self.invoke(procedure, args, ctx).await
    }

    async fn invoke(
        &self,
        procedure: &str,
        args: Value,
        ctx: CallContext,
    ) -> Result<Value, TransportError> {
        // Clone the handler out so no map guard is held across the await
        let handler = self
            .registrations
            .get(procedure)
            .map(|r| r.handler.clone())
            .ok_or_else(|| {
                TransportError::application(
                    NO_SUCH_PROCEDURE,
                    format!("no callee registered for procedure <{}>", procedure),
                )
            })?;

        handler.call(args, ctx).await.map_err(|e| match e {
            HandlerError::InvalidArguments(message) => {
                TransportError::application(INVALID_ARGUMENT, message)
            }
            HandlerError::Application { error, message } => {
                TransportError::application(error, message)
            }
            HandlerError::Failed(message) => TransportError::application(RUNTIME_ERROR, message),
        })
    }
}

#[async_trait]
impl Transport for LoopbackBroker {
    async fn register(
        &self,
        name: &str,
        handler: Arc<dyn ProcedureHandler>,
        options: &RegisterOptions,
    ) -> Result<(), TransportError> {
        self.register_attempts.fetch_add(1, Ordering::SeqCst);

        let scripted = self.register_script.lock().pop_front().flatten();
        if let Some(err) = scripted {
            debug!("Loopback rejecting registration of {}: {}", name, err);
            return Err(err);
        }

        let previous = self.registrations.insert(
            name.to_string(),
            Registration {
                handler,
                options: options.clone(),
            },
        );
        if previous.is_none() {
            self.register_log.lock().push(name.to_string());
        }
        debug!("Loopback registered {}", name);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("publish refused".to_string()));
        }

        self.published.lock().push(Publication {
            topic: topic.to_string(),
            payload,
            options: options.clone(),
        });
        Ok(())
    }

    async fn call(&self, procedure: &str, args: Value) -> Result<Value, TransportError> {
        self.invoke(procedure, args, CallContext::new(procedure)).await
    }
}

/// Progress sink that keeps every update it accepts.
#[derive(Default)]
pub struct ProgressRecorder {
    updates: Mutex<Vec<ProgressUpdate>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl ProgressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (or succeed again)
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().clone()
    }

    /// Sends attempted, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressSink for ProgressRecorder {
    async fn send(&self, update: &ProgressUpdate) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.updates.lock().push(update.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_app_core::handler_fn;
    use serde_json::json;

    fn echo() -> Arc<dyn ProcedureHandler> {
        handler_fn(|args: Value, _ctx| async move { Ok(args) })
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let broker = LoopbackBroker::new();
        let options = RegisterOptions::new().with("invoke", "roundrobin");
        broker.register("echo", echo(), &options).await.unwrap();

        assert!(broker.is_registered("echo"));
        assert_eq!(broker.registration_options("echo"), Some(options));
        assert_eq!(broker.call("echo", json!([1, 2])).await.unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_reregister_and_unknown() {
        let broker = LoopbackBroker::new();
        broker.register("echo", echo(), &RegisterOptions::new()).await.unwrap();
        let constant = handler_fn(|_args: Value, _ctx| async move { Ok(Value::from(7)) });
        broker.register("echo", constant, &RegisterOptions::new()).await.unwrap();

        assert_eq!(broker.call("echo", Value::Null).await.unwrap(), Value::from(7));

        let err = broker.call("missing", Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::Application { ref error, .. } if error == NO_SUCH_PROCEDURE));
        assert_eq!(broker.registered(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_rejections_are_consumed_in_order() {
        let broker = LoopbackBroker::new();
        broker.reject_next_registrations(1);
        broker.allow_next_registrations(1);
        broker.fail_registration_with(TransportError::Closed);

        let err = broker.register("a", echo(), &RegisterOptions::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Application { ref error, .. } if error == PROCEDURE_ALREADY_EXISTS));
        broker.register("a", echo(), &RegisterOptions::new()).await.unwrap();
        assert_eq!(
            broker.register("b", echo(), &RegisterOptions::new()).await.unwrap_err(),
            TransportError::Closed
        );
        broker.register("b", echo(), &RegisterOptions::new()).await.unwrap();
        assert_eq!(broker.register_attempts(), 4);
        assert_eq!(broker.registered(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_handler_errors_become_application_errors() {
        let broker = LoopbackBroker::new();
        let failing = handler_fn(|_args: Value, _ctx| async move {
            Err(HandlerError::InvalidArguments("need two numbers".into()))
        });
        broker.register("bad", failing, &RegisterOptions::new()).await.unwrap();

        let err = broker.call("bad", Value::Null).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::application(INVALID_ARGUMENT, "need two numbers")
        );
    }

    #[tokio::test]
    async fn test_call_with_progress_passes_sink() {
        let broker = LoopbackBroker::new();
        let handler = handler_fn(|_args: Value, ctx: CallContext| async move {
            if let Some(sink) = &ctx.progress {
                sink.send(&ProgressUpdate::new(0, Some(1), None))
                    .await
                    .map_err(|e| HandlerError::Failed(e.to_string()))?;
            }
            Ok(Value::Bool(ctx.has_progress()))
        });
        broker.register("job", handler, &RegisterOptions::new()).await.unwrap();

        let recorder = Arc::new(ProgressRecorder::new());
        let result = broker
            .call_with_progress("job", Value::Null, recorder.clone())
            .await
            .unwrap();

        assert_eq!(result, Value::Bool(true));
        assert_eq!(recorder.updates(), vec![ProgressUpdate::new(0, Some(1), None)]);
        assert_eq!(broker.call("job", Value::Null).await.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_publish_records_and_fails_on_demand() {
        let broker = LoopbackBroker::new();
        let options = PublishOptions::new().with("acknowledge", true);
        broker.publish("news", json!({"n": 1}), &options).await.unwrap();

        broker.fail_publishes(true);
        assert!(broker.publish("news", json!({"n": 2}), &options).await.is_err());

        assert_eq!(broker.published_on("news"), vec![json!({"n": 1})]);
        assert_eq!(broker.publications()[0].options, options);
    }
}
