//! Bounded polling for asynchronously propagated remote state.
//!
//! Catalog resource delivery, assignment delivery and PIM provisioning all
//! report an intermediate state first, and freshly created directory objects
//! take a while to become visible to the governance service. Both cases are
//! handled by a loop with a hard bound on attempts and wall-clock time that
//! also observes cancellation between and during attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ReconcileError, ReconcileResult};

/// Longest accepted timeout or interval for a polling loop.
pub const MAX_POLL_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounds for one polling loop.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay before the second attempt.
    pub interval: Duration,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Overall wall-clock budget for the loop.
    pub timeout: Duration,
    /// Growth factor applied to the interval after each pending attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for the grown interval.
    pub max_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 24,
            timeout: Duration::from_secs(180),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl PollConfig {
    /// Defaults for replication-lag retries (lookups that may briefly miss).
    #[must_use]
    pub fn lookup_defaults() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 12,
            timeout: Duration::from_secs(90),
            backoff_multiplier: 1.5,
            max_interval: Duration::from_secs(20),
        }
    }

    /// Millisecond-scale bounds for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(10),
            max_attempts: 5,
            timeout: Duration::from_secs(5),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_millis(10),
        }
    }

    /// Validates the bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be > 0".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if self.timeout > MAX_POLL_DURATION || self.interval > MAX_POLL_DURATION {
            return Err(format!(
                "timeout and interval must be <= {}s",
                MAX_POLL_DURATION.as_secs()
            ));
        }
        Ok(())
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_multiplier)
            .min(self.max_interval.max(self.interval))
    }
}

/// Outcome of one polling attempt.
#[derive(Debug)]
pub enum PollStep<T> {
    /// Terminal success.
    Done(T),
    /// Not there yet; carries the observed state for diagnostics.
    Pending(String),
    /// Terminal failure reported by the service.
    Failed {
        state: String,
        diagnostic: Option<String>,
    },
}

/// Classification of the request states reported by the governance service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Succeeded,
    Failed,
    Pending,
}

impl RequestState {
    /// Classifies a request or delivery state string (case-insensitive).
    #[must_use]
    pub fn classify(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "delivered" | "provisioned" => RequestState::Succeeded,
            "deliveryfailed" | "denied" | "failed" | "canceled" | "cancelled" | "revoked"
            | "denieddeliveryfailed" => RequestState::Failed,
            _ => RequestState::Pending,
        }
    }
}

/// Repeats `step` until it reports a terminal state or the bounds run out.
///
/// # Errors
///
/// - `DeliveryFailed` when a step reports a terminal failure
/// - `RetriesExhausted` with the last observed state when attempts or time run out
/// - `Cancelled` when `cancel` fires
/// - any error returned by `step` itself
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    config: &PollConfig,
    operation: &str,
    mut step: F,
) -> ReconcileResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ReconcileResult<PollStep<T>>>,
{
    let started = Instant::now();
    let deadline = started
        .checked_add(config.timeout)
        .or_else(|| started.checked_add(MAX_POLL_DURATION))
        .unwrap_or(started);
    let mut interval = config.interval;
    let mut last_state = String::from("unknown");
    let mut attempts = 0u32;

    while attempts < config.max_attempts {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            result = tokio::time::timeout_at(deadline, step(attempts)) => match result {
                Ok(outcome) => outcome?,
                Err(_) => break,
            },
        };

        match outcome {
            PollStep::Done(value) => {
                debug!(operation, attempts, "Poll reached terminal success");
                return Ok(value);
            }
            PollStep::Failed { state, diagnostic } => {
                return Err(ReconcileError::DeliveryFailed {
                    operation: operation.to_string(),
                    state,
                    diagnostic,
                });
            }
            PollStep::Pending(state) => {
                debug!(operation, attempts, state = %state, "Still pending");
                last_state = state;
            }
        }

        if attempts >= config.max_attempts {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let pause = interval.min(deadline - now);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            () = tokio::time::sleep(pause) => {}
        }
        interval = config.next_interval(interval);
    }

    Err(ReconcileError::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
        last_state,
    })
}

/// Retries a lookup while the object is not yet visible.
///
/// A lookup answering `None` (or a not-found error) is treated as replication
/// lag and retried within the bounds.
///
/// # Errors
///
/// `RetriesExhausted` when the object never shows up, plus anything `poll_until` returns.
pub async fn await_visible<T, F, Fut>(
    cancel: &CancellationToken,
    config: &PollConfig,
    operation: &str,
    mut lookup: F,
) -> ReconcileResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReconcileResult<Option<T>>>,
{
    poll_until(cancel, config, operation, |_| {
        let fut = lookup();
        async move {
            match fut.await {
                Ok(Some(value)) => Ok(PollStep::Done(value)),
                Ok(None) => Ok(PollStep::Pending("not visible".to_string())),
                Err(e) if e.is_not_found() => Ok(PollStep::Pending("not found".to_string())),
                Err(e) => Err(e),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify_request_states() {
        assert_eq!(RequestState::classify("Delivered"), RequestState::Succeeded);
        assert_eq!(RequestState::classify("Provisioned"), RequestState::Succeeded);
        assert_eq!(RequestState::classify("deliveryFailed"), RequestState::Failed);
        assert_eq!(RequestState::classify("Denied"), RequestState::Failed);
        assert_eq!(RequestState::classify("Scheduled"), RequestState::Pending);
        assert_eq!(RequestState::classify("submitted"), RequestState::Pending);
        assert_eq!(RequestState::classify("Granted"), RequestState::Pending);
    }

    #[test]
    fn test_config_validation() {
        assert!(PollConfig::default().validate().is_ok());
        assert!(PollConfig::lookup_defaults().validate().is_ok());
        let config = PollConfig {
            max_attempts: 0,
            ..PollConfig::for_testing()
        };
        assert!(config.validate().is_err());

        let config = PollConfig {
            timeout: Duration::from_secs(u64::MAX),
            ..PollConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_poll_tolerates_unrepresentable_deadline() {
        let cancel = CancellationToken::new();
        let config = PollConfig {
            timeout: Duration::from_secs(u64::MAX),
            ..PollConfig::for_testing()
        };
        let result = poll_until(&cancel, &config, "deliver", |_| async {
            Ok(PollStep::Done(()))
        })
        .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_interval_growth_is_capped() {
        let config = PollConfig {
            interval: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(5),
            ..PollConfig::default()
        };
        assert_eq!(config.next_interval(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(config.next_interval(Duration::from_secs(4)), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_returns_on_terminal_success() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = poll_until(&cancel, &PollConfig::for_testing(), "deliver", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(PollStep::Pending("Scheduled".to_string()))
                } else {
                    Ok(PollStep::Done("Delivered"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "Delivered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_exhausts_with_last_state() {
        let cancel = CancellationToken::new();
        let result: ReconcileResult<()> =
            poll_until(&cancel, &PollConfig::for_testing(), "deliver", |_| async {
                Ok(PollStep::Pending("Scheduled".to_string()))
            })
            .await;

        match result {
            Err(ReconcileError::RetriesExhausted {
                attempts,
                last_state,
                ..
            }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last_state, "Scheduled");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_respects_wall_clock_budget() {
        let cancel = CancellationToken::new();
        let config = PollConfig {
            interval: Duration::from_millis(20),
            max_attempts: 1000,
            timeout: Duration::from_millis(100),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let result: ReconcileResult<()> = poll_until(&cancel, &config, "deliver", |_| async {
            Ok(PollStep::Pending("Scheduled".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ReconcileError::RetriesExhausted { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_poll_surfaces_terminal_failure() {
        let cancel = CancellationToken::new();
        let result: ReconcileResult<()> =
            poll_until(&cancel, &PollConfig::for_testing(), "deliver", |_| async {
                Ok(PollStep::Failed {
                    state: "DeliveryFailed".to_string(),
                    diagnostic: Some("origin missing".to_string()),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(ReconcileError::DeliveryFailed { ref state, .. }) if state == "DeliveryFailed"
        ));
    }

    #[tokio::test]
    async fn test_poll_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: ReconcileResult<()> =
            poll_until(&cancel, &PollConfig::default(), "deliver", |_| async {
                Ok(PollStep::Pending("Scheduled".to_string()))
            })
            .await;
        assert!(matches!(result, Err(ReconcileError::Cancelled)));
    }

    #[tokio::test]
    async fn test_await_visible_retries_absence() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let found = await_visible(&cancel, &PollConfig::for_testing(), "lookup", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n == 0 { None } else { Some(n) }) }
        })
        .await
        .unwrap();

        assert_eq!(found, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
