//! Configuration management for the cohort engine
//!
//! TOML file support with environment variable overrides and defaults.
//!
//! ```toml
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! pool_size = 16
//!
//! [engine]
//! namespace = "cohort"
//! first_day_of_week = "sunday"
//! default_granularity = "fifteen_minutes"
//!
//! [monitoring]
//! log_level = "info"
//! ```

use crate::engine::EngineConfig;
use crate::error::{Result, ValidationError};
use crate::keys::DEFAULT_NAMESPACE;
use crate::store::redis::{RedisConfig, RetryPolicy};
use crate::types::Granularity;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CohortConfig {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisSection,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineSection,

    /// Logging and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSection {
    /// Server URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Maximum commands in flight
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Use TLS (`rediss://`)
    #[serde(default)]
    pub tls_enabled: bool,
}

/// Engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSection {
    /// Key namespace prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// First day of week, e.g. "sunday" or "mon"
    #[serde(default = "default_first_day_of_week")]
    pub first_day_of_week: String,

    /// Tracking and query leaf granularity
    #[serde(default = "default_granularity")]
    pub default_granularity: Granularity,

    /// Bucket reads in flight per call
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level or `EnvFilter` directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_pool_size() -> u32 { 16 }
fn default_connection_timeout_ms() -> u64 { 5_000 }
fn default_command_timeout_ms() -> u64 { 1_000 }
fn default_max_retries() -> u32 { 3 }
fn default_namespace() -> String { DEFAULT_NAMESPACE.to_string() }
fn default_first_day_of_week() -> String { "sunday".to_string() }
fn default_granularity() -> Granularity { Granularity::FifteenMinutes }
fn default_max_concurrent_fetches() -> usize { crate::engine::DEFAULT_MAX_CONCURRENT_FETCHES }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
            tls_enabled: false,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            first_day_of_week: default_first_day_of_week(),
            default_granularity: default_granularity(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl EngineSection {
    /// Parsed first day of week
    pub fn weekday(&self) -> std::result::Result<Weekday, ValidationError> {
        self.first_day_of_week
            .trim()
            .parse::<Weekday>()
            .map_err(|_| ValidationError::InvalidFormat {
                field: "engine.first_day_of_week".to_string(),
                message: format!("'{}' is not a day of the week", self.first_day_of_week),
            })
    }
}

impl CohortConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            ValidationError::InvalidFormat {
                field: path.display().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// An unparseable `COHORT_DEFAULT_GRANULARITY` is logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("COHORT_REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(namespace) = std::env::var("COHORT_NAMESPACE") {
            self.engine.namespace = namespace;
        }
        if let Ok(weekday) = std::env::var("COHORT_FIRST_DAY_OF_WEEK") {
            self.engine.first_day_of_week = weekday;
        }
        if let Ok(granularity) = std::env::var("COHORT_DEFAULT_GRANULARITY") {
            match granularity.parse() {
                Ok(g) => self.engine.default_granularity = g,
                Err(e) => tracing::warn!("Ignoring COHORT_DEFAULT_GRANULARITY: {}", e),
            }
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.to_redis_config()
            .validate()
            .map_err(|message| ValidationError::InvalidFormat {
                field: "redis".to_string(),
                message,
            })?;

        if self.redis.command_timeout_ms > 60_000 {
            return Err(ValidationError::OutOfRange {
                field: "redis.command_timeout_ms".to_string(),
                value: self.redis.command_timeout_ms.to_string(),
                min: "1".to_string(),
                max: "60000".to_string(),
            }
            .into());
        }
        if self.engine.max_concurrent_fetches > 4096 {
            return Err(ValidationError::OutOfRange {
                field: "engine.max_concurrent_fetches".to_string(),
                value: self.engine.max_concurrent_fetches.to_string(),
                min: "1".to_string(),
                max: "4096".to_string(),
            }
            .into());
        }

        self.to_engine_config()?.validate()
    }

    /// Engine settings
    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            namespace: self.engine.namespace.clone(),
            first_day_of_week: self.engine.weekday()?,
            default_granularity: self.engine.default_granularity,
            max_concurrent_fetches: self.engine.max_concurrent_fetches,
        })
    }

    /// Redis pool settings
    pub fn to_redis_config(&self) -> RedisConfig {
        let retry = RetryPolicy {
            max_retries: self.redis.max_retries,
            ..Default::default()
        };
        RedisConfig::with_url(self.redis.url.clone())
            .pool_size(self.redis.pool_size)
            .connection_timeout(Duration::from_millis(self.redis.connection_timeout_ms))
            .command_timeout(Duration::from_millis(self.redis.command_timeout_ms))
            .retry_policy(retry)
            .tls(self.redis.tls_enabled)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| ValidationError::InvalidFormat {
            field: "config".to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_default_config() {
        let config = CohortConfig::default();
        assert_eq!(config.engine.namespace, "cohort");
        assert_eq!(config.engine.default_granularity, Granularity::FifteenMinutes);
        assert!(config.monitoring.metrics_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: CohortConfig = toml::from_str(
            r#"
            [redis]
            url = "redis://cache:6380"

            [engine]
            first_day_of_week = "Monday"
            default_granularity = "hour"
            "#,
        )
        .unwrap();

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.redis.pool_size, 16);
        let engine = config.to_engine_config().unwrap();
        assert_eq!(engine.first_day_of_week, Weekday::Mon);
        assert_eq!(engine.default_granularity, Granularity::Hour);
    }

    #[test]
    fn test_invalid_weekday() {
        let mut config = CohortConfig::default();
        config.engine.first_day_of_week = "someday".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = CohortConfig::default();
        config.redis.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = CohortConfig::default();
        config.engine.max_concurrent_fetches = 10_000;
        assert!(config.validate().is_err());

        let mut config = CohortConfig::default();
        config.engine.default_granularity = Granularity::Quarter;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.toml");

        let mut config = CohortConfig::default();
        config.engine.namespace = "analytics".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = CohortConfig::from_file(&path).unwrap();
        assert_eq!(loaded.engine.namespace, "analytics");
        assert!(matches!(
            CohortConfig::from_file(dir.path().join("missing.toml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("COHORT_NAMESPACE", "from-env");
        std::env::set_var("COHORT_DEFAULT_GRANULARITY", "day");
        let config = CohortConfig::from_env();
        assert_eq!(config.engine.namespace, "from-env");
        assert_eq!(config.engine.default_granularity, Granularity::Day);
        std::env::remove_var("COHORT_NAMESPACE");
        std::env::remove_var("COHORT_DEFAULT_GRANULARITY");
    }
}
