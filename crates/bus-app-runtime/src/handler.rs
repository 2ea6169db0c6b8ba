use bus_app_core::{handler_fn, HandlerResult, ProcedureHandler, RegisterOptions, CallContext};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Procedure {0} is already declared")]
    Duplicate(String),

    #[error("Procedure name must not be empty")]
    EmptyName,
}

/// A procedure the application wants exposed, keyed by its undecorated name
#[derive(Clone)]
pub struct ProcedureDescriptor {
    pub name: String,
    pub handler: Arc<dyn ProcedureHandler>,
    pub options: RegisterOptions,
}

impl std::fmt::Debug for ProcedureDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureDescriptor")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Procedures declared by an application, in declaration order
#[derive(Default, Clone, Debug)]
pub struct ProcedureRegistry {
    descriptors: Vec<ProcedureDescriptor>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a procedure under `name`
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ProcedureHandler>,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.has_procedure(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        self.descriptors.push(ProcedureDescriptor {
            name,
            handler,
            options,
        });
        Ok(())
    }

    /// Declare an async closure with default options
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, handler_fn(f), RegisterOptions::new())
    }

    pub fn get(&self, name: &str) -> Option<&ProcedureDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn has_procedure(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[ProcedureDescriptor] {
        &self.descriptors
    }

    pub fn into_descriptors(self) -> Vec<ProcedureDescriptor> {
        self.descriptors
    }
}
