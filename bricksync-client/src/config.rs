//! Configuration loading for the bricksync client.
//!
//! Connection settings are required. Retry, circuit breaker, cache and
//! logging sections fall back to the shared defaults when omitted.

use bricksync_core::{CachePolicyTable, CircuitBreakerPolicy, RetryPolicy};
use bricksync_transport::{Credentials, HttpTransportConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::telemetry::LogFormat;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BRICKSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub auth: Credentials,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicy,
    #[serde(default)]
    pub cache: CachePolicyTable,
    #[serde(default = "default_janitor_interval_ms")]
    pub janitor_interval_ms: u64,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_janitor_interval_ms() -> u64 {
    30_000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or BRICKSYNC_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.api_base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be >= 1".to_string(),
            });
        }
        if let Some(max_delay_ms) = self.retry.max_delay_ms {
            if max_delay_ms < self.retry.base_delay_ms {
                return Err(ConfigError::InvalidValue {
                    field: "retry.max_delay_ms",
                    reason: "must be >= base_delay_ms".to_string(),
                });
            }
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.failure_threshold",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.janitor_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "janitor_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            base_url: self.api_base_url.trim().to_string(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            credentials: self.auth.clone(),
        }
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
