//! Engine configuration.

use std::time::Duration;

use egov_graph::GraphClientConfig;

use crate::poll::PollConfig;

/// Settings shared by every reconciliation run by one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounds for delivery/provisioning status polling.
    pub poll: PollConfig,
    /// Bounds for replication-lag lookups.
    pub lookup_retry: PollConfig,
    /// Transport settings.
    pub http: GraphClientConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            lookup_retry: PollConfig::lookup_defaults(),
            http: GraphClientConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration with millisecond-scale bounds for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            poll: PollConfig::for_testing(),
            lookup_retry: PollConfig::for_testing(),
            http: GraphClientConfig::for_testing(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// This allows tests to supply variables without mutating process-global
    /// environment state.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable is set but malformed.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();

        let poll = PollConfig {
            interval: secs(&reader, "EGOV_POLL_INTERVAL_SECS", defaults.poll.interval)?,
            max_attempts: number(&reader, "EGOV_POLL_MAX_ATTEMPTS", defaults.poll.max_attempts)?,
            timeout: secs(&reader, "EGOV_POLL_TIMEOUT_SECS", defaults.poll.timeout)?,
            ..defaults.poll
        };

        let lookup_retry = PollConfig {
            interval: secs(
                &reader,
                "EGOV_LOOKUP_RETRY_INTERVAL_SECS",
                defaults.lookup_retry.interval,
            )?,
            max_attempts: number(
                &reader,
                "EGOV_LOOKUP_RETRY_ATTEMPTS",
                defaults.lookup_retry.max_attempts,
            )?,
            ..defaults.lookup_retry
        };

        let http = GraphClientConfig {
            request_timeout: secs(
                &reader,
                "EGOV_HTTP_TIMEOUT_SECS",
                defaults.http.request_timeout,
            )?,
            ..defaults.http
        };

        let config = Self {
            poll,
            lookup_retry,
            http,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poll
            .validate()
            .map_err(|e| ConfigError::InvalidValue("poll".into(), e))?;
        self.lookup_retry
            .validate()
            .map_err(|e| ConfigError::InvalidValue("lookup_retry".into(), e))?;
        self.http
            .validate()
            .map_err(|e| ConfigError::InvalidValue("http".into(), e.to_string()))
    }
}

fn number<F>(reader: &F, key: &str, default: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn secs<F>(reader: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
