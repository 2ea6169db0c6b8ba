use crate::queue::TaskQueue;
use bus_app_core::{PublishOptions, TransportPtr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Liveness announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSignal {
    pub app_name: String,
    pub instance_id: String,
    pub alive: bool,
}

pub fn build_signal(app_name: &str, instance_id: &str) -> HeartbeatSignal {
    HeartbeatSignal {
        app_name: app_name.to_string(),
        instance_id: instance_id.to_string(),
        alive: true,
    }
}

pub fn heartbeat_topic(app_name: &str) -> String {
    format!("system.app.{}.alive", app_name)
}

/// Queues heartbeat publications for the configured application.
#[derive(Clone)]
pub struct HeartbeatEmitter {
    app_name: Option<String>,
    instance_id: String,
    transport: TransportPtr,
}

impl HeartbeatEmitter {
    pub fn new(
        app_name: Option<String>,
        instance_id: impl Into<String>,
        transport: TransportPtr,
    ) -> Self {
        HeartbeatEmitter {
            app_name: app_name.filter(|name| !name.is_empty()),
            instance_id: instance_id.into(),
            transport,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.app_name.is_some()
    }

    pub fn topic(&self) -> Option<String> {
        self.app_name.as_deref().map(heartbeat_topic)
    }

    /// Enqueue one heartbeat publish. Returns `false` without queueing
    /// anything when no application name is configured.
    pub fn send_health_check_signal(&self, queue: &TaskQueue) -> bool {
        let Some(app_name) = &self.app_name else {
            debug!("No application name configured, skipping heartbeat");
            return false;
        };

        let signal = build_signal(app_name, &self.instance_id);
        let topic = heartbeat_topic(app_name);
        let transport = self.transport.clone();

        let submitted = queue.submit(format!("heartbeat {}", topic), async move {
            let payload = serde_json::to_value(&signal)?;
            transport
                .publish(&topic, payload, &PublishOptions::new())
                .await?;
            Ok(())
        });

        match submitted {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not queue heartbeat: {}", e);
                false
            }
        }
    }
}
