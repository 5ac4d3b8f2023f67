//! Configuration validation module.
//!
//! Collects every problem in one pass so a misconfigured process fails at
//! startup with the full list, not one error at a time.

use crate::{AppConfig, LoggingConfig};
use meridian_jobs::JobsConfig;
use std::fmt;
use tracing::warn;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Application name is empty.
    MissingAppName,
    /// A log filter directive names an unknown level.
    InvalidLogLevel { value: String },
    /// Timeout or interval must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Retry policy allows no attempts.
    NoAttempts,
    /// Queue or worker pool setup rejected by the dispatch core.
    Jobs { message: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAppName => write!(f, "Application name cannot be empty"),
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: trace, debug, info, warn, error, off)",
                    value
                )
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::NoAttempts => write!(f, "jobs.retry.max_attempts must be at least 1"),
            Self::Jobs { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error", "off"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if config.app.name.trim().is_empty() {
            errors.push(ConfigValidationError::MissingAppName);
        }
        Self::validate_logging(&config.logging, &mut errors);
        Self::validate_jobs(&config.jobs, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_logging(config: &LoggingConfig, errors: &mut Vec<ConfigValidationError>) {
        for directive in config.level.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let level = directive.rsplit('=').next().unwrap_or(directive);
            if !Self::VALID_LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                errors.push(ConfigValidationError::InvalidLogLevel {
                    value: directive.to_string(),
                });
            }
        }
    }

    fn validate_jobs(config: &JobsConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.retry.max_attempts == 0 {
            errors.push(ConfigValidationError::NoAttempts);
        }

        let mut timeouts = vec![
            ("jobs.lease.duration_secs", config.lease.duration_secs),
            ("jobs.lease.reap_interval_secs", config.lease.reap_interval_secs),
            ("jobs.worker.shutdown_timeout_secs", config.worker.shutdown_timeout_secs),
        ];
        // The tick interval is unused while the scheduler is off.
        if config.scheduler.enabled {
            timeouts.push(("jobs.scheduler.tick_interval_secs", config.scheduler.tick_interval_secs));
        }
        for (name, value) in timeouts {
            if value == 0 {
                errors.push(ConfigValidationError::NonPositiveTimeout {
                    name: name.to_string(),
                    value,
                });
            }
        }

        if config.lease.reap_interval_secs > config.lease.duration_secs {
            warn!(
                reap_interval_secs = config.lease.reap_interval_secs,
                lease_duration_secs = config.lease.duration_secs,
                "Reap interval is longer than the lease; expired jobs will wait for the next sweep"
            );
        }

        match config.queue_registry() {
            Ok(registry) => {
                if let Err(e) = config
                    .pool_configs(&registry)
                    .and_then(|pools| meridian_jobs::config::validate_pools(&pools, &registry))
                {
                    errors.push(ConfigValidationError::Jobs { message: e.to_string() });
                }
            }
            Err(e) => errors.push(ConfigValidationError::Jobs { message: e.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_jobs::PoolConfig;

    #[test]
    fn test_default_config_passes() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "info,meridian=loud".to_string();

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ConfigValidationError::InvalidLogLevel {
                value: "meridian=loud".to_string()
            }]
        );
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = AppConfig::default();
        config.app.name = " ".to_string();
        config.jobs.retry.max_attempts = 0;
        config.jobs.lease.duration_secs = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.contains(&ConfigValidationError::MissingAppName));
        assert!(errors.contains(&ConfigValidationError::NoAttempts));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::NonPositiveTimeout { name, .. } if name == "jobs.lease.duration_secs"
        )));
    }

    #[test]
    fn test_tick_interval_checked_only_when_scheduler_enabled() {
        let mut config = AppConfig::default();
        config.jobs.scheduler.tick_interval_secs = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ConfigValidationError::NonPositiveTimeout {
                name: "jobs.scheduler.tick_interval_secs".to_string(),
                value: 0,
            }]
        );
        assert!(config.jobs.validate().is_err());

        config.jobs.scheduler.enabled = false;
        assert!(ConfigValidator::validate(&config).is_ok());
        assert!(config.jobs.validate().is_ok());
    }

    #[test]
    fn test_zero_shutdown_timeout_rejected_by_both_checks() {
        let mut config = AppConfig::default();
        config.jobs.worker.shutdown_timeout_secs = 0;

        assert!(ConfigValidator::validate(&config).is_err());
        assert!(config.jobs.validate().is_err());
    }

    #[test]
    fn test_uncovered_queue_is_reported() {
        let mut config = AppConfig::default();
        config.jobs.pools = vec![PoolConfig::new("only", ["default".to_string()], 2)];

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ConfigValidationError::Jobs { message } if message.contains("not served by any worker pool")
        ));
    }

    #[test]
    fn test_duplicate_queue_rank_is_reported() {
        let mut config = AppConfig::default();
        config.jobs.queues[1].rank = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(&errors[0], ConfigValidationError::Jobs { .. }));
    }
}
