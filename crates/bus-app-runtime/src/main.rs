use bus_app_core::auth::{Challenge, TICKET};
use bus_app_core::Transport;
use bus_app_runtime::demo::DemoApp;
use bus_app_runtime::progress::ConsoleSink;
use bus_app_runtime::{AppConfig, ExitStatus, JoinOutcome, LoopbackBroker, Session};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bus-app")]
#[command(about = "Message bus application runtime", long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Router URL
    #[arg(long)]
    url: Option<String>,

    /// Realm to join
    #[arg(long)]
    realm: Option<String>,

    /// Authentication principal
    #[arg(long)]
    principal: Option<String>,

    /// Application name, enables heartbeats
    #[arg(long)]
    app_name: Option<String>,

    /// Prefix added to every procedure name
    #[arg(long)]
    prefix: Option<String>,

    /// Suffix added to every procedure name
    #[arg(long)]
    suffix: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Run the demo calls and exit instead of waiting for Ctrl-C
    #[arg(long)]
    once: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(realm) = &self.realm {
            config.realm = realm.clone();
        }
        if let Some(principal) = &self.principal {
            config.principal = Some(principal.clone());
        }
        if let Some(app_name) = &self.app_name {
            config.app_name = Some(app_name.clone());
        }
        if let Some(prefix) = &self.prefix {
            config.methods_prefix = prefix.clone();
        }
        if let Some(suffix) = &self.suffix {
            config.methods_suffix = suffix.clone();
        }
    }
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Exercise the registered procedures through the broker
async fn run_demo(broker: &LoopbackBroker, config: &AppConfig) -> anyhow::Result<()> {
    let add = broker.call(&config.decorate("add"), json!([2, 3])).await?;
    tracing::info!("add(2, 3) = {}", add);

    let sub = broker.call(&config.decorate("sub"), json!([10, 4])).await?;
    tracing::info!("sub(10, 4) = {}", sub);

    let launched = broker
        .call_with_progress(
            &config.decorate("countdown"),
            json!({"from": 3}),
            Arc::new(ConsoleSink),
        )
        .await?;
    tracing::info!("countdown = {}", launched);

    Ok(())
}

async fn run(args: Args) -> anyhow::Result<ExitStatus> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!("Configuration: {:?}", config);

    let broker = Arc::new(LoopbackBroker::new());
    let session = Session::new(config.clone(), DemoApp::new(), broker.clone());

    session.on_open();
    let join = session.on_connect();
    tracing::info!("Join request: {:?}", join);

    if join.principal.is_some() && session.on_challenge(&Challenge::new(TICKET)).is_err() {
        session.on_disconnect();
        return Ok(session.on_close());
    }

    session.on_welcome();
    match session.on_join().await {
        JoinOutcome::Ready(names) => tracing::info!("Serving {:?}", names),
        JoinOutcome::Disconnect => {
            session.on_disconnect();
            return Ok(session.on_close());
        }
    }

    if let Err(e) = run_demo(&broker, &config).await {
        tracing::error!("Demo calls failed: {:#}", e);
    }

    if args.once {
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_idle() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "{} tasks still queued or running at shutdown",
                session.queue().len()
            );
        }
    } else {
        tracing::info!("Waiting for Ctrl-C");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");
    }

    session.on_leave("wamp.close.normal");
    session.on_disconnect();
    Ok(session.on_close())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let status = run(args).await?;
    std::process::exit(status.code());
}
