use crate::handler::ProcedureDescriptor;
use bus_app_core::{TransportError, TransportPtr};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Total registration attempts before giving up
pub const REGISTRATION_ATTEMPTS: u32 = 3;

/// Wait between two registration attempts
pub const REGISTRATION_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Registration failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("Registration aborted: {0}")]
    Fatal(TransportError),
}

/// State of the batch after one attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationOutcome {
    pub attempt: u32,
    pub registered_names: Vec<String>,
    pub last_error: Option<TransportError>,
}

/// Registers an application's procedures as one batch, retrying the whole
/// batch when the broker rejects a name.
pub struct RegistrationManager {
    transport: TransportPtr,
    descriptors: Vec<ProcedureDescriptor>,
    prefix: String,
    suffix: String,
    backoff: Duration,
}

impl RegistrationManager {
    pub fn new(
        transport: TransportPtr,
        descriptors: Vec<ProcedureDescriptor>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        RegistrationManager {
            transport,
            descriptors,
            prefix: prefix.into(),
            suffix: suffix.into(),
            backoff: REGISTRATION_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn decorate(&self, name: &str) -> String {
        format!("{}{}{}", self.prefix, name, self.suffix)
    }

    pub fn decorated_names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| self.decorate(&d.name)).collect()
    }

    /// Register every descriptor in order and return the decorated names
    pub async fn register_all(&self) -> Result<Vec<String>, RegistrationError> {
        let mut outcome = RegistrationOutcome::default();

        while outcome.attempt < REGISTRATION_ATTEMPTS {
            outcome.attempt += 1;
            info!(
                "Registering {} procedures (attempt {}/{})",
                self.descriptors.len(),
                outcome.attempt,
                REGISTRATION_ATTEMPTS
            );

            match self.attempt(&mut outcome).await {
                Ok(()) => {
                    info!("All procedures registered");
                    return Ok(outcome.registered_names);
                }
                Err(e) if e.is_application() => {
                    warn!("Registration attempt {} failed: {}", outcome.attempt, e);
                    outcome.last_error = Some(e);
                    if outcome.attempt < REGISTRATION_ATTEMPTS {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(e) => return Err(RegistrationError::Fatal(e)),
            }
        }

        Err(RegistrationError::Exhausted {
            attempts: outcome.attempt,
            last_error: outcome.last_error.unwrap_or(TransportError::Closed),
        })
    }

    async fn attempt(&self, outcome: &mut RegistrationOutcome) -> Result<(), TransportError> {
        outcome.registered_names.clear();

        for descriptor in &self.descriptors {
            let name = self.decorate(&descriptor.name);
            self.transport
                .register(&name, descriptor.handler.clone(), &descriptor.options)
                .await?;
            info!("Registered {}", name);
            outcome.registered_names.push(name);
        }

        Ok(())
    }
}
