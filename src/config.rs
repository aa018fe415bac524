//! Service configuration.
//!
//! Settings for the store connection, the worker pool and the analysis
//! backend. Every value has a default and can be overridden from the
//! environment.

use std::time::Duration;
use thiserror::Error;

use crate::scheduler::{SchedulerConfig, DEFAULT_KEY_PREFIX};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the queue service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for every queue key.
    pub key_prefix: String,

    // Worker pool settings
    pub scheduler: SchedulerConfig,

    // Analysis backend settings
    /// Base URL of the analysis service.
    pub analysis_service_url: String,
    /// Timeout for one analysis request.
    pub analysis_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            scheduler: SchedulerConfig::default(),
            analysis_service_url: "http://localhost:8000".to_string(),
            analysis_timeout: Duration::from_secs(120),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `QUEUE_KEY_PREFIX`: Key prefix (default: task)
    /// - `QUEUE_WORKERS`: Number of workers (default: 3)
    /// - `QUEUE_POLL_TIMEOUT_SECS`: Dequeue wait per poll (default: 5)
    /// - `QUEUE_JOB_TIMEOUT_SECS`: Processing timeout per task (default: 600)
    /// - `QUEUE_CLEANUP_INTERVAL_SECS`: Maintenance interval (default: 3600)
    /// - `QUEUE_RECLAIM_LEASES`: Release expired leases (default: false)
    /// - `QUEUE_SHUTDOWN_TIMEOUT_SECS`: Bound on shutdown (default: unbounded)
    /// - `ANALYSIS_SERVICE_URL`: Analysis backend URL (default: http://localhost:8000)
    /// - `ANALYSIS_TIMEOUT_SECS`: Analysis request timeout (default: 120)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("QUEUE_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("QUEUE_WORKERS") {
            config.scheduler.num_workers = parse_env_value(&val, "QUEUE_WORKERS")?;
        }

        if let Some(val) = lookup("QUEUE_POLL_TIMEOUT_SECS") {
            config.scheduler.poll_timeout = parse_env_secs(&val, "QUEUE_POLL_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("QUEUE_JOB_TIMEOUT_SECS") {
            config.scheduler.job_timeout = parse_env_secs(&val, "QUEUE_JOB_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("QUEUE_CLEANUP_INTERVAL_SECS") {
            config.scheduler.cleanup_interval =
                parse_env_secs(&val, "QUEUE_CLEANUP_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("QUEUE_RECLAIM_LEASES") {
            config.scheduler.reclaim_leases = parse_env_bool(&val, "QUEUE_RECLAIM_LEASES")?;
        }

        if let Some(val) = lookup("QUEUE_SHUTDOWN_TIMEOUT_SECS") {
            config.scheduler.shutdown_timeout =
                Some(parse_env_secs(&val, "QUEUE_SHUTDOWN_TIMEOUT_SECS")?);
        }

        if let Some(val) = lookup("ANALYSIS_SERVICE_URL") {
            config.analysis_service_url = val;
        }

        if let Some(val) = lookup("ANALYSIS_TIMEOUT_SECS") {
            config.analysis_timeout = parse_env_secs(&val, "ANALYSIS_TIMEOUT_SECS")?;
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.poll_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_timeout must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.cleanup_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        if self.analysis_service_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "analysis_service_url cannot be empty".to_string(),
            ));
        }

        if self.analysis_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "analysis_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.scheduler.num_workers = num_workers;
        self
    }

    pub fn with_analysis_service_url(mut self, url: impl Into<String>) -> Self {
        self.analysis_service_url = url.into();
        self
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "task");
        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.scheduler.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.scheduler.job_timeout, Duration::from_secs(600));
        assert_eq!(config.scheduler.cleanup_interval, Duration::from_secs(3600));
        assert!(!config.scheduler.reclaim_leases);
        assert_eq!(config.scheduler.shutdown_timeout, None);
        assert_eq!(config.analysis_service_url, "http://localhost:8000");
        assert_eq!(config.analysis_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6380/2"),
            ("QUEUE_KEY_PREFIX", "staging"),
            ("QUEUE_WORKERS", "8"),
            ("QUEUE_POLL_TIMEOUT_SECS", "2"),
            ("QUEUE_JOB_TIMEOUT_SECS", "60"),
            ("QUEUE_CLEANUP_INTERVAL_SECS", "300"),
            ("QUEUE_RECLAIM_LEASES", "yes"),
            ("QUEUE_SHUTDOWN_TIMEOUT_SECS", "30"),
            ("ANALYSIS_SERVICE_URL", "http://ai:9000"),
            ("ANALYSIS_TIMEOUT_SECS", "15"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.key_prefix, "staging");
        assert_eq!(config.scheduler.num_workers, 8);
        assert_eq!(config.scheduler.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.scheduler.job_timeout, Duration::from_secs(60));
        assert_eq!(config.scheduler.cleanup_interval, Duration::from_secs(300));
        assert!(config.scheduler.reclaim_leases);
        assert_eq!(
            config.scheduler.shutdown_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.analysis_service_url, "http://ai:9000");
        assert_eq!(config.analysis_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let result = AppConfig::from_lookup(lookup(&[("QUEUE_WORKERS", "many")]));
        match result {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "QUEUE_WORKERS"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_from_lookup_invalid_bool() {
        let result = AppConfig::from_lookup(lookup(&[("QUEUE_RECLAIM_LEASES", "maybe")]));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("expected boolean value"));
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = AppConfig::default().with_num_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("num_workers"));
    }

    #[test]
    fn test_validation_empty_prefix() {
        let result = AppConfig::default().with_key_prefix("").validate();
        assert!(result.unwrap_err().to_string().contains("key_prefix"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let config = AppConfig::default()
            .with_scheduler(SchedulerConfig::default().with_job_timeout(Duration::ZERO));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("job_timeout"));
    }

    #[test]
    fn test_config_builder() {
        let config = AppConfig::new()
            .with_redis_url("redis://other:6379")
            .with_analysis_service_url("http://analysis")
            .with_analysis_timeout(Duration::from_secs(5));

        assert_eq!(config.redis_url, "redis://other:6379");
        assert_eq!(config.analysis_service_url, "http://analysis");
        assert_eq!(config.analysis_timeout, Duration::from_secs(5));
    }
}
