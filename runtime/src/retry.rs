//! Exponential backoff.
//!
//! [`BusConnection::connect`](crate::BusConnection::connect) retries the
//! connector with it, and services use it around publishes that must
//! eventually go out (the delayed `expiration:complete`).
//!
//! # Example
//!
//! ```rust
//! use ticketbus_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(8)
//!     .initial_delay(Duration::from_millis(250))
//!     .jitter(true)
//!     .build();
//!
//! let sequence = retry_with_backoff(&policy, || async { Ok::<u64, String>(7) }).await?;
//! assert_eq!(sequence, 7);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently to retry.
///
/// Defaults: 5 retries, 100ms first delay doubling up to 10s, no jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Builder starting from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay after the failed attempt number `attempt` (0-based):
    /// `min(initial_delay * multiplier^attempt, max_delay)`, then jittered.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let scaled_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped_ms
        };

        Duration::from_millis(scaled_ms as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Cap on any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between delays.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Randomize delays so many clients do not retry in lockstep.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Finish the policy.
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Run `operation` until it succeeds or `policy` runs out of retries.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up at once on an error that
/// `is_retryable` rejects.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final attempt.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(retries = attempt, "Succeeded after retrying");
                }
                return Ok(result);
            }
            Err(err) if !is_retryable(&err) => {
                tracing::warn!(error = %err, "Not retryable, giving up");
                return Err(err);
            }
            Err(err) if attempt >= policy.max_retries => {
                tracing::error!(retries = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Attempt failed, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(5))
            .build()
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(400))
            .jitter(true)
            .build();

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn broker_that_comes_up_on_the_third_try_is_reached() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let result = retry_with_backoff(&fast_policy(3), || {
            let attempts = Arc::clone(&attempts);
            async move {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("connection refused"),
                    _ => Ok("connected"),
                }
            }
        })
        .await;

        assert_eq!(result, Ok("connected"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_error() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let result: Result<(), String> = retry_with_backoff(&fast_policy(2), || {
            let attempts = Arc::clone(&attempts);
            async move { Err(format!("timeout #{}", attempts.fetch_add(1, Ordering::SeqCst))) }
        })
        .await;

        assert_eq!(result, Err("timeout #2".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let result = retry_with_predicate(
            &fast_policy(5),
            || {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection closed")
                }
            },
            |err: &&str| !err.contains("closed"),
        )
        .await;

        assert_eq!(result, Err("connection closed"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
