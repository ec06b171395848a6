//! Configuration for the admission engine.
//!
//! Loaded from environment variables with defaults. Call `dotenvy::dotenv()`
//! first to pick up a local `.env` file.

use crate::validation::AdmissionLimits;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use studyhub_runtime::RetryPolicy;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but does not parse
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
    },

    /// A value parses but is out of range
    #[error("{name} {reason}")]
    OutOfRange {
        /// Variable name
        name: &'static str,
        /// What is wrong
        reason: &'static str,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Event form bounds
    pub admission: AdmissionConfig,
    /// Event bus and notification settings
    pub bus: BusConfig,
    /// Process settings
    pub server: ServerConfig,
}

/// Admission configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Smallest finite capacity (`ADMISSION_MIN_CAPACITY`, default 1)
    pub min_capacity: u32,
    /// Longest title (`ADMISSION_MAX_TITLE_LENGTH`, default 50)
    pub max_title_length: usize,
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Topic for enrollment events (`NOTIFICATION_TOPIC`)
    pub topic: String,
    /// Per-topic buffer of the in-memory bus (`EVENT_BUS_CAPACITY`)
    pub capacity: usize,
    /// Publish retries before giving up (`PUBLISH_MAX_RETRIES`)
    pub publish_max_retries: usize,
    /// First retry delay in milliseconds (`PUBLISH_INITIAL_DELAY_MS`)
    pub publish_initial_delay_ms: u64,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Prometheus exporter address; disabled when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        let limits = AdmissionLimits::default();
        Self {
            admission: AdmissionConfig {
                min_capacity: limits.min_capacity,
                max_title_length: limits.max_title_length,
            },
            bus: BusConfig {
                topic: "enrollment-events".to_string(),
                capacity: 1024,
                publish_max_retries: 3,
                publish_initial_delay_ms: 50,
            },
            server: ServerConfig {
                log_level: "info".to_string(),
                metrics_addr: None,
                shutdown_timeout: 5,
            },
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable does not parse or a value is out
    /// of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let metrics_addr = match env::var("METRICS_ADDR") {
            Ok(value) if !value.trim().is_empty() => Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { name: "METRICS_ADDR", value })?,
            ),
            _ => None,
        };

        let config = Self {
            admission: AdmissionConfig {
                min_capacity: parsed("ADMISSION_MIN_CAPACITY", defaults.admission.min_capacity)?,
                max_title_length: parsed(
                    "ADMISSION_MAX_TITLE_LENGTH",
                    defaults.admission.max_title_length,
                )?,
            },
            bus: BusConfig {
                topic: env::var("NOTIFICATION_TOPIC").unwrap_or(defaults.bus.topic),
                capacity: parsed("EVENT_BUS_CAPACITY", defaults.bus.capacity)?,
                publish_max_retries: parsed(
                    "PUBLISH_MAX_RETRIES",
                    defaults.bus.publish_max_retries,
                )?,
                publish_initial_delay_ms: parsed(
                    "PUBLISH_INITIAL_DELAY_MS",
                    defaults.bus.publish_initial_delay_ms,
                )?,
            },
            server: ServerConfig {
                log_level: env::var("LOG_LEVEL").unwrap_or(defaults.server.log_level),
                metrics_addr,
                shutdown_timeout: parsed(
                    "SHUTDOWN_TIMEOUT_SECS",
                    defaults.server.shutdown_timeout,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check ranges that parsing alone does not enforce
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.min_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                name: "ADMISSION_MIN_CAPACITY",
                reason: "must be at least 1",
            });
        }
        if self.admission.max_title_length == 0 {
            return Err(ConfigError::OutOfRange {
                name: "ADMISSION_MAX_TITLE_LENGTH",
                reason: "must be at least 1",
            });
        }
        if self.bus.topic.trim().is_empty() {
            return Err(ConfigError::OutOfRange {
                name: "NOTIFICATION_TOPIC",
                reason: "must not be blank",
            });
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::OutOfRange {
                name: "EVENT_BUS_CAPACITY",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Form bounds for the admission reducer
    #[must_use]
    pub const fn limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            min_capacity: self.admission.min_capacity,
            max_title_length: self.admission.max_title_length,
        }
    }

    /// Retry policy for domain event publication
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.bus.publish_max_retries)
            .initial_delay(Duration::from_millis(self.bus.publish_initial_delay_ms))
            .build()
    }

    /// Graceful shutdown timeout
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.limits(), AdmissionLimits::default());
        assert_eq!(config.bus.topic, "enrollment-events");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn retry_policy_follows_bus_settings() {
        let mut config = Config::default();
        config.bus.publish_max_retries = 0;
        assert!(!config.retry_policy().should_retry(0));

        config.bus.publish_max_retries = 2;
        config.bus.publish_initial_delay_ms = 10;
        let policy = config.retry_policy();
        assert!(policy.should_retry(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
    }

    #[test]
    fn zero_minimum_capacity_is_rejected() {
        let mut config = Config::default();
        config.admission.min_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { name: "ADMISSION_MIN_CAPACITY", .. })
        ));
    }
}
