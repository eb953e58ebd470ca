//! Transport configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{GraphError, GraphResult};

/// Default Graph endpoint used when the envelope leaves it empty.
pub const DEFAULT_SERVICE_ENDPOINT: &str = "https://graph.microsoft.com/v1.0";

/// HTTP-level settings shared by every client built from one engine.
#[derive(Debug, Clone)]
pub struct GraphClientConfig {
    /// Overall per-request timeout.
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Retry policy for throttling and transient gateway errors.
    pub retry: RetryPolicy,
}

impl Default for GraphClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl GraphClientConfig {
    /// Configuration with short retry delays for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            retry: RetryPolicy::for_testing(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Config` describing the invalid field.
    pub fn validate(&self) -> GraphResult<()> {
        if self.request_timeout.is_zero() {
            return Err(GraphError::Config("request_timeout must be > 0".into()));
        }
        self.retry
            .validate()
            .map_err(|e| GraphError::Config(format!("Invalid retry policy: {e}")))
    }

    /// Builds the underlying HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot be created.
    pub fn build_http_client(&self) -> GraphResult<reqwest::Client> {
        self.validate()?;
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| GraphError::Config(format!("Failed to create HTTP client: {e}")))
    }
}
