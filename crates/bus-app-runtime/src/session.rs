use crate::config::AppConfig;
use crate::context::AppContext;
use crate::error_sink::{ErrorReport, ErrorSink};
use crate::executor::BlockingExecutor;
use crate::handler::{ProcedureRegistry, RegistryError};
use crate::heartbeat::HeartbeatEmitter;
use crate::processor::{ProcessorHandle, TaskQueueProcessor};
use crate::queue::{task_queue, TaskQueue, TaskReceiver};
use crate::registration::{RegistrationManager, REGISTRATION_BACKOFF};
use async_trait::async_trait;
use bus_app_core::auth::{self, Challenge, TICKET};
use bus_app_core::{AuthError, HandlerError, TransportError, TransportPtr};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How the process should end, one variant per failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    RegistrationFailed,
    AuthenticationFailed,
    ConnectionFailed,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::RegistrationFailed => 10,
            ExitStatus::AuthenticationFailed => 20,
            ExitStatus::ConnectionFailed => 100,
        }
    }

    pub fn is_clean(&self) -> bool {
        *self == ExitStatus::Clean
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitStatus::Clean => "clean",
            ExitStatus::RegistrationFailed => "registration failed",
            ExitStatus::AuthenticationFailed => "authentication failed",
            ExitStatus::ConnectionFailed => "connection failed",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// What the transport adapter should send when joining the realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub realm: String,
    pub auth_methods: Vec<String>,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Procedures are registered under these decorated names
    Ready(Vec<String>),
    /// The adapter must drop the connection
    Disconnect,
}

/// A bus application: its procedures plus an optional startup hook.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Declare every procedure to register on join, in order
    fn procedures(
        &self,
        registry: &mut ProcedureRegistry,
        ctx: &AppContext,
    ) -> Result<(), RegistryError>;

    /// Runs once the procedures are registered and the processor is up
    async fn ready(&self, _ctx: AppContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifecycle glue between a transport adapter and an [`Application`]. The
/// adapter calls the `on_*` hooks; joining registers procedures and starts
/// the task queue processor.
pub struct Session<A: Application> {
    config: AppConfig,
    app: Arc<A>,
    transport: TransportPtr,
    queue: TaskQueue,
    ctx: AppContext,
    errors: ErrorSink,
    heartbeat: HeartbeatEmitter,
    receiver: Mutex<Option<TaskReceiver>>,
    processor: Mutex<Option<ProcessorHandle>>,
    status: Mutex<ExitStatus>,
    registration_backoff: Duration,
}

impl<A: Application> Session<A> {
    pub fn new(config: AppConfig, app: A, transport: TransportPtr) -> Self {
        let instance_id = config.instance_id();
        let (queue, receiver) = task_queue(BlockingExecutor::new(config.blocking_threads));

        let errors = ErrorSink::new(
            queue.clone(),
            transport.clone(),
            config.app_name.clone(),
            instance_id.clone(),
        );
        let heartbeat =
            HeartbeatEmitter::new(config.app_name.clone(), instance_id, transport.clone());
        let ctx = AppContext::new(config.clone(), queue.clone(), transport.clone(), errors.clone());

        Session {
            config,
            app: Arc::new(app),
            transport,
            queue,
            ctx,
            errors,
            heartbeat,
            receiver: Mutex::new(Some(receiver)),
            processor: Mutex::new(None),
            status: Mutex::new(ExitStatus::Clean),
            registration_backoff: REGISTRATION_BACKOFF,
        }
    }

    pub fn with_registration_backoff(mut self, backoff: Duration) -> Self {
        self.registration_backoff = backoff;
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn exit_status(&self) -> ExitStatus {
        *self.status.lock()
    }

    /// Whether the task queue processor has been started
    pub fn is_processing(&self) -> bool {
        self.processor.lock().is_some()
    }

    /// No task is waiting or running. A dequeued task still counts until it
    /// has finished.
    pub fn is_idle(&self) -> bool {
        match self.processor.lock().as_ref() {
            Some(handle) => handle.processed() >= self.queue.submitted(),
            None => self.queue.is_empty(),
        }
    }

    pub fn on_open(&self) {
        info!("Transport open to {}", self.config.url);
    }

    pub fn on_connect(&self) -> JoinRequest {
        info!(
            "Connected, joining realm {} as {}",
            self.config.realm,
            self.config.principal.as_deref().unwrap_or("anonymous")
        );
        JoinRequest {
            realm: self.config.realm.clone(),
            auth_methods: vec![TICKET.to_string()],
            principal: self.config.principal.clone(),
        }
    }

    /// Answer an authentication challenge. Any failure is fatal.
    pub fn on_challenge(&self, challenge: &Challenge) -> Result<String, AuthError> {
        info!("Authentication challenge: {}", challenge.method);

        let answer = match self.config.secret.as_deref() {
            Some(secret) => auth::resolve_challenge(challenge, secret),
            None => Err(AuthError::MissingSecret),
        };

        if let Err(e) = &answer {
            error!("Authentication failed: {}", e);
            self.record(ExitStatus::AuthenticationFailed);
        }
        answer
    }

    pub fn on_welcome(&self) {
        info!("Session established on realm {}", self.config.realm);
    }

    /// Register the application's procedures, start processing and run the
    /// application's `ready` hook.
    pub async fn on_join(&self) -> JoinOutcome {
        info!("Joined realm {}, registering {}", self.config.realm, self.app.name());

        let mut registry = ProcedureRegistry::new();
        if let Err(e) = self.app.procedures(&mut registry, &self.ctx) {
            error!("Invalid procedure declarations: {}", e);
            self.record(ExitStatus::RegistrationFailed);
            return JoinOutcome::Disconnect;
        }

        let manager = RegistrationManager::new(
            self.transport.clone(),
            registry.into_descriptors(),
            self.config.methods_prefix.clone(),
            self.config.methods_suffix.clone(),
        )
        .with_backoff(self.registration_backoff);

        let names = match manager.register_all().await {
            Ok(names) => names,
            Err(e) => {
                error!("{}", e);
                self.record(ExitStatus::RegistrationFailed);
                return JoinOutcome::Disconnect;
            }
        };

        self.start_processor();

        if let Err(e) = self.app.ready(self.ctx.clone()).await {
            let origin = format!("{} ready", self.app.name());
            self.errors.report(&ErrorReport::from_error(origin, &e));
        }

        JoinOutcome::Ready(names)
    }

    pub fn on_leave(&self, reason: &str) {
        info!("Left realm {}: {}", self.config.realm, reason);
    }

    pub fn on_disconnect(&self) {
        info!("Transport disconnected");
    }

    /// Stop processing and return the status the process must exit with
    pub fn on_close(&self) -> ExitStatus {
        if let Some(handle) = self.processor.lock().take() {
            info!("Stopping task queue processor after {} tasks", handle.processed());
            handle.abort();
        }

        let status = self.exit_status();
        info!("Session closed, exit status {}", status);
        status
    }

    pub fn on_connection_failed(&self, err: &TransportError) {
        error!("Connection to {} failed: {}", self.config.url, err);
        self.record(ExitStatus::ConnectionFailed);
    }

    /// Handler errors the transport could not hand back to a caller
    pub fn on_user_error(&self, procedure: &str, err: &HandlerError) {
        error!("Procedure {} failed: {}", procedure, err);
    }

    fn start_processor(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!("Task queue processor already running");
            return;
        };

        let processor = TaskQueueProcessor::new(
            receiver,
            self.queue.clone(),
            self.heartbeat.clone(),
            self.errors.clone(),
        );
        *self.processor.lock() = Some(processor.spawn());
    }

    /// The first failure recorded decides the exit status
    fn record(&self, status: ExitStatus) {
        let mut current = self.status.lock();
        if current.is_clean() {
            *current = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackBroker;
    use bus_app_core::auth::WAMPCRA;
    use bus_app_core::{PublishOptions, Transport};
    use serde_json::Value;

    struct Pair;

    #[async_trait]
    impl Application for Pair {
        fn name(&self) -> &str {
            "pair"
        }

        fn procedures(
            &self,
            registry: &mut ProcedureRegistry,
            _ctx: &AppContext,
        ) -> Result<(), RegistryError> {
            registry.register_fn("left", |args: Value, _ctx| async move { Ok(args) })?;
            registry.register_fn("right", |args: Value, _ctx| async move { Ok(args) })
        }
    }

    fn session(config: AppConfig) -> (Session<Pair>, Arc<LoopbackBroker>) {
        let broker = Arc::new(LoopbackBroker::new());
        let session = Session::new(config, Pair, broker.clone())
            .with_registration_backoff(Duration::from_millis(1));
        (session, broker)
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::RegistrationFailed.code(), 10);
        assert_eq!(ExitStatus::AuthenticationFailed.code(), 20);
        assert_eq!(ExitStatus::ConnectionFailed.code(), 100);
        assert_eq!(ExitStatus::RegistrationFailed.to_string(), "registration failed (10)");
    }

    #[test]
    fn test_join_request() {
        let config = AppConfig {
            realm: "realm-x".into(),
            principal: Some("svc".into()),
            ..AppConfig::default()
        };
        let (session, _broker) = session(config);

        assert_eq!(
            session.on_connect(),
            JoinRequest {
                realm: "realm-x".into(),
                auth_methods: vec!["ticket".into()],
                principal: Some("svc".into()),
            }
        );
    }

    #[test]
    fn test_challenges() {
        let config = AppConfig {
            secret: Some("secret123".into()),
            ..AppConfig::default()
        };
        let (session, _broker) = session(config);

        assert_eq!(session.on_challenge(&Challenge::new("ticket")).unwrap(), "secret123");
        let cra = Challenge::new(WAMPCRA).with_extra("challenge", "{\"nonce\": \"abc\"}");
        assert_eq!(
            session.on_challenge(&cra).unwrap(),
            auth::compute_wcs("secret123", "{\"nonce\": \"abc\"}")
        );
        assert!(session.exit_status().is_clean());

        let err = session.on_challenge(&Challenge::new("scram")).unwrap_err();
        assert_eq!(err, AuthError::UnsupportedMethod("scram".into()));
        assert_eq!(session.exit_status(), ExitStatus::AuthenticationFailed);
    }

    #[test]
    fn test_challenge_without_secret() {
        let (session, _broker) = session(AppConfig::default());
        assert_eq!(
            session.on_challenge(&Challenge::new("ticket")),
            Err(AuthError::MissingSecret)
        );
        assert_eq!(session.on_close().code(), 20);
    }

    #[tokio::test]
    async fn test_join_registers_and_starts_processor() {
        let config = AppConfig {
            methods_prefix: "com.acme.".into(),
            ..AppConfig::default()
        };
        let (session, broker) = session(config);

        let outcome = session.on_join().await;

        assert_eq!(
            outcome,
            JoinOutcome::Ready(vec!["com.acme.left".into(), "com.acme.right".into()])
        );
        assert_eq!(broker.registered(), vec!["com.acme.left", "com.acme.right"]);
        assert!(session.is_processing());
        assert_eq!(session.on_close(), ExitStatus::Clean);
        assert!(!session.is_processing());
    }

    #[tokio::test]
    async fn test_exhausted_registration_disconnects() {
        let (session, broker) = session(AppConfig::default());
        broker.reject_next_registrations(3);

        assert_eq!(session.on_join().await, JoinOutcome::Disconnect);
        assert!(!session.is_processing());
        assert_eq!(session.on_close().code(), 10);
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let (session, _broker) = session(AppConfig::default());
        session.on_connection_failed(&TransportError::Connection("refused".into()));
        session.on_connection_failed(&TransportError::Closed);
        let _ = session.on_challenge(&Challenge::new("ticket"));

        assert_eq!(session.exit_status(), ExitStatus::ConnectionFailed);
    }

    async fn wait_until(done: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_idle_only_after_running_task_finishes() {
        let (session, broker) = session(AppConfig::default());
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let transport = broker.clone();
        session
            .context()
            .submit("slow publish", async move {
                let _ = gate.await;
                transport
                    .publish("pair.done", Value::Null, &PublishOptions::new())
                    .await?;
                Ok(())
            })
            .unwrap();
        assert!(!session.is_idle());

        session.on_join().await;
        wait_until(|| session.queue().is_empty()).await;

        // Dequeued but still waiting on the gate
        assert!(!session.is_idle());

        release.send(()).unwrap();
        wait_until(|| session.is_idle()).await;
        assert_eq!(broker.published_on("pair.done").len(), 1);
        session.on_close();
    }
}
