use crate::context::AppContext;
use crate::handler::{ProcedureRegistry, RegistryError};
use crate::session::Application;
use async_trait::async_trait;
use bus_app_core::{CallContext, HandlerError, HandlerResult};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Topic the demo announces itself on once it is ready
pub const READY_TOPIC: &str = "demo.ready";

/// Arithmetic plus a countdown that reports progress
pub struct DemoApp {
    tick: Duration,
}

impl DemoApp {
    pub fn new() -> Self {
        DemoApp {
            tick: Duration::from_millis(250),
        }
    }

    /// Pause between two countdown steps
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

impl Default for DemoApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Two numeric operands, as `[a, b]`
fn operands(args: &Value) -> Result<(f64, f64), HandlerError> {
    let pair = args
        .as_array()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| HandlerError::InvalidArguments("expected [a, b]".to_string()))?;

    match (pair[0].as_f64(), pair[1].as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(HandlerError::InvalidArguments(
            "operands must be numbers".to_string(),
        )),
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        json!(value)
    }
}

async fn countdown(ctx: AppContext, tick: Duration, args: Value, call: CallContext) -> HandlerResult {
    let from = args
        .get("from")
        .and_then(Value::as_u64)
        .ok_or_else(|| HandlerError::InvalidArguments("expected {\"from\": n}".to_string()))?;
    let from = u32::try_from(from)
        .map_err(|_| HandlerError::InvalidArguments("countdown too long".to_string()))?;

    let mut progress = ctx.progress(&call).with_total(from);
    for remaining in (1..=from).rev() {
        progress.advance(Some(&format!("T-{}", remaining))).await;
        tokio::time::sleep(tick).await;
    }
    progress.finish(Some("liftoff")).await;

    Ok(json!({"launched": true, "steps": from}))
}

#[async_trait]
impl Application for DemoApp {
    fn name(&self) -> &str {
        "demo"
    }

    fn procedures(
        &self,
        registry: &mut ProcedureRegistry,
        ctx: &AppContext,
    ) -> Result<(), RegistryError> {
        registry.register_fn("add", |args: Value, _call| async move {
            let (a, b) = operands(&args)?;
            Ok(number(a + b))
        })?;

        registry.register_fn("sub", |args: Value, _call| async move {
            let (a, b) = operands(&args)?;
            Ok(number(a - b))
        })?;

        let ctx = ctx.clone();
        let tick = self.tick;
        registry.register_fn("countdown", move |args: Value, call: CallContext| {
            countdown(ctx.clone(), tick, args, call)
        })
    }

    async fn ready(&self, ctx: AppContext) -> anyhow::Result<()> {
        info!("Demo application ready as {}", ctx.instance_id());

        ctx.publish(
            READY_TOPIC,
            json!({
                "app_name": ctx.config().app_name,
                "instance_id": ctx.instance_id(),
            }),
        )?;

        let snapshot = ctx.clone();
        ctx.submit_fn("machine snapshot", move || async move {
            let machine = snapshot.machine().clone();
            let (memory, load) = snapshot
                .run_blocking(move || (machine.memory(), machine.load()))
                .await?;
            info!("Memory {:.1}% used, load {:.2}", memory, load.one);
            Ok(())
        })?;

        Ok(())
    }
}
