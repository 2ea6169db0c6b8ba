use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Environment prefix for every setting (`WAMP_URL`, `WAMP_REALM`, ...)
pub const ENV_PREFIX: &str = "WAMP";

/// Older deployments export the secret under this name
pub const LEGACY_SECRET_VAR: &str = "WAMPYSECRET";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub url: String,
    pub realm: String,
    pub principal: Option<String>,
    pub secret: Option<String>,
    pub methods_prefix: String,
    pub methods_suffix: String,
    /// Enables heartbeats on `system.app.<name>.alive` when set
    pub app_name: Option<String>,
    pub instance_id: Option<String>,
    pub blocking_threads: usize,
    pub progress_topic: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            realm: "realm1".to_string(),
            principal: None,
            secret: None,
            methods_prefix: String::new(),
            methods_suffix: String::new(),
            app_name: None,
            instance_id: None,
            blocking_threads: 8,
            progress_topic: None,
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("url", &self.url)
            .field("realm", &self.realm)
            .field("principal", &self.principal)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("methods_prefix", &self.methods_prefix)
            .field("methods_suffix", &self.methods_suffix)
            .field("app_name", &self.app_name)
            .field("instance_id", &self.instance_id)
            .field("blocking_threads", &self.blocking_threads)
            .field("progress_topic", &self.progress_topic)
            .finish()
    }
}

impl AppConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Layer defaults, an optional YAML file and `WAMP_*` environment
    /// variables, in that order.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Same as [`AppConfig::load`] but reads variables from `env` instead of
    /// the process environment when given.
    pub fn load_with_env(
        path: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let legacy_secret = match &env {
            Some(vars) => vars.get(LEGACY_SECRET_VAR).cloned(),
            None => std::env::var(LEGACY_SECRET_VAR).ok(),
        };

        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).source(env));

        let mut config: AppConfig = builder.build()?.try_deserialize()?;

        if config.secret.is_none() {
            config.secret = legacy_secret;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".to_string()));
        }
        if self.realm.trim().is_empty() {
            return Err(ConfigError::Invalid("realm must not be empty".to_string()));
        }
        if self.blocking_threads == 0 {
            return Err(ConfigError::Invalid(
                "blocking_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decorate a logical procedure name with the configured prefix/suffix
    pub fn decorate(&self, name: &str) -> String {
        format!("{}{}{}", self.methods_prefix, name, self.methods_suffix)
    }

    /// Identity reported in heartbeats and error reports.
    ///
    /// An explicit `instance_id` wins; otherwise the process-wide id is used,
    /// so reconnecting sessions keep the same identity.
    pub fn instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) => id.clone(),
            None => generate_instance_id().to_string(),
        }
    }
}

/// `<hostname>-<pid>-<random>`, computed once per process.
pub fn generate_instance_id() -> &'static str {
    static INSTANCE_ID: OnceCell<String> = OnceCell::new();

    INSTANCE_ID.get_or_init(|| {
        use std::process;
        use uuid::Uuid;

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let uuid = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &uuid[..8])
    })
}
