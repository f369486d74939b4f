//! Configuration management for Hivecount.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{HivecountError, Result};
use crate::ratelimit::StrategyKind;

/// Free-form settings handed to a backend factory.
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// Main configuration for the Hivecount service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HivecountConfig {
    /// Ordered list of backends; order matters for failover
    pub backends: Vec<BackendConfig>,

    /// Failover strategy applied to every operation
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Minimum time between two health checks of the same backend
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Upper bound on a single health check
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,

    /// Consecutive failures before a backend is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Upper bound on a single counter operation against one backend
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration of one named backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,
    /// Registry key selecting the backend implementation
    pub kind: String,
    /// Implementation specific settings
    #[serde(default)]
    pub settings: Settings,
}

impl BackendConfig {
    /// Create a backend config with empty settings.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            settings: Settings::new(),
        }
    }

    /// Attach settings to this backend config.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Deserialize the settings map into a typed settings struct.
    pub fn typed_settings<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.settings.clone())).map_err(|e| {
            HivecountError::Configuration(format!(
                "invalid settings for backend '{}' ({}): {}",
                self.name, self.kind, e
            ))
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_operation_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl HivecountConfig {
    /// Create a configuration with default tuning for the given backends.
    pub fn new(backends: Vec<BackendConfig>, strategy: StrategyKind) -> Self {
        Self {
            backends,
            strategy,
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            failure_threshold: default_failure_threshold(),
            operation_timeout_ms: default_operation_timeout(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a file path.
    ///
    /// Values from the file can be overridden with `HIVECOUNT__*` environment
    /// variables, e.g. `HIVECOUNT__STRATEGY=round_robin`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(HivecountError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config: HivecountConfig = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix("HIVECOUNT").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HivecountError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: HivecountConfig = serde_yaml::from_str(yaml)
            .map_err(|e| HivecountError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contradictions.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(HivecountError::Configuration(
                "at least one backend is required".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.backends.len());
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(HivecountError::Configuration(
                    "backend name must not be empty".to_string(),
                ));
            }
            if backend.kind.trim().is_empty() {
                return Err(HivecountError::Configuration(format!(
                    "backend '{}' has no kind",
                    backend.name
                )));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(HivecountError::Configuration(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
        }

        if self.failure_threshold == 0 {
            return Err(HivecountError::Configuration(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(HivecountError::Configuration(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.health_check_timeout_ms == 0 {
            return Err(HivecountError::Configuration(
                "health_check_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
