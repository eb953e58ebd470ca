//! Throttling and transient-failure retry policy for Graph requests.
//!
//! Graph answers 429 with a `Retry-After` header when a tenant is throttled and
//! occasionally 502/503/504 while a backend is recycling. Both are retried with
//! exponential backoff and jitter; anything else is returned to the caller.

use std::time::Duration;
use tracing::warn;

/// Configuration for request retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for exponential backoff in milliseconds (default: 1000ms).
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 60000ms).
    pub max_delay_ms: u64,
    /// Jitter factor as a fraction of delay (default: 0.25 = 25%).
    pub jitter_factor: f64,
    /// Maximum retry attempts per request (default: 5).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.25,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy optimized for testing (shorter delays).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 50,
            jitter_factor: 0.0,
            max_retries: 3,
        }
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be > 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must be >= base_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be in range [0.0, 1.0]".to_string());
        }
        Ok(())
    }

    /// Parses the Retry-After header value.
    ///
    /// Only the delta-seconds form is honoured; HTTP-date values fall back to backoff.
    #[must_use]
    pub fn parse_retry_after(header_value: &str) -> Option<u64> {
        header_value.trim().parse::<u64>().ok()
    }

    /// Calculates backoff delay with exponential growth, capped at `max_delay_ms`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let delay_ms = (base * 2_f64.powi(attempt.min(30) as i32)).min(max);
        Duration::from_millis(delay_ms as u64)
    }

    /// Adds jitter to a delay using the configured factor.
    #[must_use]
    pub fn add_jitter(&self, delay: Duration) -> Duration {
        use rand::Rng;

        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let delay_ms = delay.as_millis() as f64;
        let jitter_range = delay_ms * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_range);

        Duration::from_millis((delay_ms + jitter) as u64)
    }

    /// Delay to wait before the next attempt, honouring `Retry-After` when present.
    #[must_use]
    pub fn delay_for(&self, retry_after_header: Option<&str>, attempt: u32) -> Duration {
        let delay = match retry_after_header.and_then(Self::parse_retry_after) {
            Some(secs) => {
                let capped_secs = secs.min(self.max_delay_ms / 1000);
                if secs > capped_secs {
                    warn!(
                        "Retry-After {} seconds exceeds max, capping at {} seconds",
                        secs, capped_secs
                    );
                }
                Duration::from_secs(capped_secs)
            }
            None => self.backoff_delay(attempt),
        };
        self.add_jitter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.base_delay_ms = 0;
        assert!(policy.validate().is_err());

        policy.base_delay_ms = 1000;
        policy.max_delay_ms = 500;
        assert!(policy.validate().is_err());

        policy.max_delay_ms = 60_000;
        policy.jitter_factor = 1.5;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(RetryPolicy::parse_retry_after("60"), Some(60));
        assert_eq!(RetryPolicy::parse_retry_after("  120  "), Some(120));
        assert_eq!(RetryPolicy::parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(RetryPolicy::parse_retry_after(""), None);
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter_factor: 0.0,
            max_retries: 5,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
            max_retries: 5,
        };
        assert_eq!(policy.delay_for(Some("3"), 0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(Some("600"), 0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(None, 1), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let ms = policy.add_jitter(base).as_millis() as u64;
            assert!((1000..=1250).contains(&ms), "delay {ms} out of range");
        }
    }
}
