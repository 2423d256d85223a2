//! Application configuration.
//!
//! Aggregates configuration into a single Config struct that can be loaded
//! from YAML files or environment variables.

mod broker;
mod messaging;

pub use broker::BrokerConfig;
pub use messaging::MessagingConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "telebus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TELEBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TELEBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TELEBUS_LOG";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging core configuration.
    pub messaging: MessagingConfig,
    /// Standalone broker configuration.
    pub broker: BrokerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `telebus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: short timeouts, ports shifted by `offset`.
    pub fn for_test(offset: u16) -> crate::bus::Result<Self> {
        Ok(Self {
            messaging: MessagingConfig {
                ports: crate::bus::PortLayout::with_offset(offset)?,
                linger_ms: 0,
                connect_settle_ms: 50,
                subscriber_idle_timeout_ms: 500,
                drain_timeout_ms: 500,
                request_timeout_ms: 500,
                poll_interval_ms: 20,
                ..MessagingConfig::default()
            },
            broker: BrokerConfig {
                shutdown_timeout_ms: 1_000,
                ..BrokerConfig::default()
            },
        })
    }
}
