//! Application configuration.
//!
//! Loaded from a YAML file with environment variable overrides on top.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::bus::{MessagingConfig, MessagingType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DESKBUS_CONFIG";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DESKBUS_LOG";
/// Environment variable for messaging type (memory/amqp/nats).
pub const MESSAGING_TYPE_ENV_VAR: &str = "DESKBUS_MESSAGING_TYPE";
/// Environment variable for the AMQP broker URL.
pub const AMQP_URL_ENV_VAR: &str = "DESKBUS_AMQP_URL";
/// Environment variable for the NATS server URL.
pub const NATS_URL_ENV_VAR: &str = "DESKBUS_NATS_URL";
/// Environment variable for the invocation queue keep-alive, in seconds.
pub const KEEP_ALIVE_ENV_VAR: &str = "DESKBUS_KEEP_ALIVE_SECS";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging backend configuration.
    pub messaging: MessagingConfig,
    /// Invocation queue configuration.
    pub invoke: InvokeConfig,
}

/// Invocation queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    /// Seconds of silence before a queue is considered dead.
    pub keep_alive_secs: u64,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self { keep_alive_secs: 60 }
    }
}

impl InvokeConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var(MESSAGING_TYPE_ENV_VAR) {
            match kind.as_str() {
                "memory" => self.messaging.messaging_type = MessagingType::Memory,
                "amqp" => self.messaging.messaging_type = MessagingType::Amqp,
                "nats" => self.messaging.messaging_type = MessagingType::Nats,
                other => warn!(value = %other, "Unknown messaging type, ignoring override"),
            }
        }

        if let Ok(url) = std::env::var(AMQP_URL_ENV_VAR) {
            self.messaging.amqp.url = url;
        }

        if let Ok(url) = std::env::var(NATS_URL_ENV_VAR) {
            self.messaging.nats.url = url;
        }

        if let Ok(secs) = std::env::var(KEEP_ALIVE_ENV_VAR) {
            if let Ok(s) = secs.parse() {
                self.invoke.keep_alive_secs = s;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
