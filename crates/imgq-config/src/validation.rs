//! Configuration validation.
//!
//! Collects every problem in one pass so a bad deployment fails fast with
//! the full list instead of one error per restart.

use crate::AppConfig;
use std::fmt;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Port number is invalid (must be 1-65535).
    InvalidPort { name: String, value: u16 },
    /// A timeout or interval must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Hysteresis threshold must be at least one.
    InvalidThreshold { value: u32 },
    /// Pool size must be at least one.
    InvalidPoolSize { value: usize },
    /// Job attempts must be at least one.
    InvalidMaxAttempts { value: u32 },
    /// Dead-letter retention must keep at least one record.
    InvalidRetentionCount { value: usize },
    /// Dead-letter directory is empty.
    MissingDeadLetterDirectory,
    /// Broker URL has an unsupported scheme.
    InvalidBrokerUrl { message: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort { name, value } => {
                write!(f, "Invalid port for {}: {} (must be 1-65535)", name, value)
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::InvalidThreshold { value } => {
                write!(f, "Stability threshold must be at least 1, got {}", value)
            }
            Self::InvalidPoolSize { value } => {
                write!(f, "Broker pool size must be at least 1, got {}", value)
            }
            Self::InvalidMaxAttempts { value } => {
                write!(f, "Max attempts must be at least 1, got {}", value)
            }
            Self::InvalidRetentionCount { value } => {
                write!(f, "Dead-letter retention count must be at least 1, got {}", value)
            }
            Self::MissingDeadLetterDirectory => {
                write!(f, "Dead-letter directory must not be empty")
            }
            Self::InvalidBrokerUrl { message } => {
                write!(f, "Invalid broker URL: {}", message)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_broker(config, &mut errors);
        Self::validate_monitor(config, &mut errors);
        Self::validate_queue(config, &mut errors);
        Self::validate_dead_letter(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_broker(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let broker = &config.broker;

        if let Some(url) = &broker.url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                errors.push(ConfigValidationError::InvalidBrokerUrl {
                    message: "scheme must be redis:// or rediss://".to_string(),
                });
            }
        } else if broker.port == 0 {
            errors.push(ConfigValidationError::InvalidPort {
                name: "broker.port".to_string(),
                value: broker.port,
            });
        }

        if broker.pool_size == 0 {
            errors.push(ConfigValidationError::InvalidPoolSize { value: 0 });
        }

        if broker.connect_timeout_ms == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "broker.connect_timeout_ms".to_string(),
                value: 0,
            });
        }
    }

    fn validate_monitor(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let monitor = &config.monitor;

        if monitor.stability_threshold == 0 {
            errors.push(ConfigValidationError::InvalidThreshold { value: 0 });
        }

        for (name, value) in [
            ("monitor.interval_secs", monitor.interval_secs),
            ("monitor.probe_timeout_ms", monitor.probe_timeout_ms),
            ("monitor.reconcile_interval_secs", monitor.reconcile_interval_secs),
        ] {
            if value == 0 {
                errors.push(ConfigValidationError::NonPositiveTimeout {
                    name: name.to_string(),
                    value,
                });
            }
        }
    }

    fn validate_queue(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let queue = &config.queue;

        if queue.max_attempts == 0 {
            errors.push(ConfigValidationError::InvalidMaxAttempts { value: 0 });
        }

        for (name, value) in [
            ("queue.job_timeout_secs", queue.job_timeout_secs),
            ("queue.poll_timeout_secs", queue.poll_timeout_secs),
            ("queue.cleanup_interval_secs", queue.cleanup_interval_secs),
        ] {
            if value == 0 {
                errors.push(ConfigValidationError::NonPositiveTimeout {
                    name: name.to_string(),
                    value,
                });
            }
        }
    }

    fn validate_dead_letter(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let dead_letter = &config.dead_letter;

        if dead_letter.directory.as_os_str().is_empty() {
            errors.push(ConfigValidationError::MissingDeadLetterDirectory);
        }

        if dead_letter.retention_count == 0 {
            errors.push(ConfigValidationError::InvalidRetentionCount { value: 0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = AppConfig::default();
        config.broker.port = 0;
        config.monitor.stability_threshold = 0;
        config.dead_letter.directory = PathBuf::new();
        config.dead_letter.retention_count = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ConfigValidationError::InvalidThreshold { value: 0 }));
        assert!(errors.contains(&ConfigValidationError::MissingDeadLetterDirectory));
    }

    #[test]
    fn test_port_ignored_when_url_set() {
        let mut config = AppConfig::default();
        config.broker.port = 0;
        config.broker.url = Some("redis://cache:6379/1".to_string());
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_rejects_non_redis_url() {
        let mut config = AppConfig::default();
        config.broker.url = Some("http://cache:6379".to_string());

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(errors[0], ConfigValidationError::InvalidBrokerUrl { .. }));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = AppConfig::default();
        config.monitor.probe_timeout_ms = 0;
        config.queue.job_timeout_secs = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("monitor.probe_timeout_ms"));
    }
}
