//! Configuration for the LogDot logger and metrics clients.

use std::env;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Default base URL for the logs API.
pub const DEFAULT_LOGS_BASE_URL: &str = "https://logs.logdot.io/api/v1";
/// Default base URL for the metrics API.
pub const DEFAULT_METRICS_BASE_URL: &str = "https://metrics.logdot.io/api/v1";

/// Default per-request HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry policy for the HTTP transport.
///
/// Governs backoff between transport-level failures only; HTTP error statuses
/// are returned to the caller without retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (>= 1).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper clamp on the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`crate::Logger`].
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// LogDot API key (required).
    pub api_key: String,
    /// Hostname attached to every log entry.
    pub hostname: String,
    /// Logs API base URL. Overridable for testing against a local server.
    pub base_url: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Retry policy for transport failures.
    pub retry: RetryConfig,
    /// Emit request/response traces through `tracing::debug!`.
    pub debug: bool,
    /// Cancels in-flight requests and backoff waits when triggered.
    pub cancel: CancellationToken,
}

impl LoggerConfig {
    /// Creates a config with the given credentials and default settings.
    pub fn new(api_key: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Creates a config from `LOGDOT_API_KEY`, `LOGDOT_HOSTNAME` and
    /// `LOGDOT_DEBUG` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let config = Self {
            api_key: env::var("LOGDOT_API_KEY").unwrap_or_default(),
            hostname: env::var("LOGDOT_HOSTNAME").unwrap_or_default(),
            debug: env_flag("LOGDOT_DEBUG"),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        validate_common(&self.api_key, &self.retry)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            hostname: String::new(),
            base_url: DEFAULT_LOGS_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            debug: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// Configuration for [`crate::Metrics`].
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// LogDot API key (required).
    pub api_key: String,
    /// Metrics API base URL. Overridable for testing against a local server.
    pub base_url: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Retry policy for transport failures.
    pub retry: RetryConfig,
    /// Emit request/response traces through `tracing::debug!`.
    pub debug: bool,
    /// Cancels in-flight requests and backoff waits when triggered.
    pub cancel: CancellationToken,
}

impl MetricsConfig {
    /// Creates a config with the given API key and default settings.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Creates a config from `LOGDOT_API_KEY` and `LOGDOT_DEBUG` environment
    /// variables.
    pub fn from_env() -> Result<Self, Error> {
        let config = Self {
            api_key: env::var("LOGDOT_API_KEY").unwrap_or_default(),
            debug: env_flag("LOGDOT_DEBUG"),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        validate_common(&self.api_key, &self.retry)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_METRICS_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            debug: false,
            cancel: CancellationToken::new(),
        }
    }
}

fn validate_common(api_key: &str, retry: &RetryConfig) -> Result<(), Error> {
    if api_key.is_empty() {
        return Err(Error::InvalidConfig("missing API key".to_string()));
    }
    if retry.max_attempts == 0 {
        return Err(Error::InvalidConfig(
            "retry attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|val| val.to_lowercase() == "true" || val == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults_match_documented_values() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn logger_config_defaults() {
        let config = LoggerConfig::new("ilog_live_key", "my-service");
        assert_eq!(config.base_url, DEFAULT_LOGS_BASE_URL);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let config = LoggerConfig::new("", "my-service");
        let err = config.validate().expect_err("empty key should fail");
        assert!(err.to_string().contains("missing API key"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = MetricsConfig::new("key");
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
