//! Retry mechanism shared by peer reconnection and EMS delivery
//!
//! Provides a retry policy with optional exponential backoff and jitter, a
//! per-operation attempt schedule, and a cancellable retry loop.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry loop outcome when the operation never succeeded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Maximum attempts exceeded
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The owner shut down while waiting for the next attempt
    #[error("Retry cancelled")]
    Cancelled,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts (0 means unlimited)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// Unlimited attempts at a constant interval
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Create from configuration values
    pub fn from_config(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(initial_delay_ms)),
            backoff_multiplier: backoff_multiplier.max(1.0),
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Delay to wait after the given number of failed attempts (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;

        // delay = initial_delay * (multiplier ^ (failures - 1))
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let mut delay = if scaled.is_finite() {
            Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    fn limit_label(&self) -> String {
        if self.max_attempts == 0 {
            "∞".to_string()
        } else {
            self.max_attempts.to_string()
        }
    }
}

/// Attempt bookkeeping for one retried operation
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    failures: u32,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return the wait before the next attempt,
    /// or `None` once the policy is exhausted
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.policy.allows(self.failures) {
            Some(self.policy.delay_for(self.failures))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires
///
/// `op` receives the 1-based attempt number.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut schedule = RetrySchedule::new(policy.clone());

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let attempt = schedule.failures() + 1;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            },
            Err(e) => {
                let last_error = e.to_string();
                let Some(delay) = schedule.record_failure() else {
                    warn!(
                        "{} failed on attempt {}/{}, giving up: {}",
                        label,
                        attempt,
                        policy.limit_label(),
                        last_error
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error,
                    });
                };

                warn!(
                    "{} failed on attempt {}/{}: {}, retrying in {:?}",
                    label,
                    attempt,
                    policy.limit_label(),
                    last_error,
                    delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {},
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_limit() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_policy_never_exhausts() {
        let mut schedule = RetrySchedule::new(RetryPolicy::fixed(Duration::from_secs(5)));
        for _ in 0..100 {
            assert_eq!(schedule.record_failure(), Some(Duration::from_secs(5)));
        }
        assert_eq!(schedule.failures(), 100);

        schedule.reset();
        assert_eq!(schedule.failures(), 0);
    }

    #[test]
    fn test_schedule_exhausts_at_max_attempts() {
        let mut schedule = RetrySchedule::new(RetryPolicy::from_config(2, 10, 1000, 2.0));
        assert_eq!(schedule.record_failure(), Some(Duration::from_millis(10)));
        assert_eq!(schedule.record_failure(), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1000)).with_jitter(true);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Duration::from_millis(1));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let result = retry(&policy, &cancel, "op", move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = RetryPolicy::from_config(2, 1, 1, 1.0);
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError> =
            retry(&policy, &cancel, "op", |_| async { Err::<(), _>("refused") }).await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last_error: "refused".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_retry_cancelled_while_waiting() {
        let policy = RetryPolicy::fixed(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError> =
            retry(&policy, &cancel, "op", |_| async { Err::<(), _>("down") }).await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
