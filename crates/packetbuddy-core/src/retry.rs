//! Retry logic for transient I/O.
//!
//! Replication pushes and remote cleanups run against a hosted database that
//! drops connections, throttles, and occasionally restarts. This module wraps
//! such operations in a bounded retry loop.
//!
//! Unlike a typical "retries after the first try" counter, [`RetryConfig`]
//! counts *attempts*: `RetryConfig::fixed(3, d)` runs the operation at most
//! three times in total and sleeps `d` between failures.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use packetbuddy_core::{RetryConfig, with_retry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::fixed(3, Duration::from_millis(10));
//!
//! let value = with_retry(&config, "push_batch", || async {
//!     Ok::<_, std::io::Error>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

impl RetryConfig {
    /// Constant delay between a bounded number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Exponential backoff for connection establishment.
    pub fn for_connect() -> Self {
        Self {
            max_attempts: 4,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set maximum number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Calculate the delay after failed attempt number `attempt` (0-based).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// The operation failed on every attempt (or with a non-retryable error).
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {last}")]
pub struct RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Name passed to [`with_retry`].
    pub operation: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// The error from the final attempt.
    #[source]
    pub last: E,
}

/// Execute an async operation with retry logic, retrying every error.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + 'static,
{
    with_retry_if(config, operation_name, |_| true, operation).await
}

/// Execute an async operation with retry logic.
///
/// Errors for which `is_retryable` returns `false` end the loop immediately.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + 'static,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts || !is_retryable(&e) {
                    return Err(RetryError {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }

                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    operation_name, attempt, max_attempts, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay, Duration::from_secs(5));
        assert!(!config.jitter);
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let config = RetryConfig::fixed(5, Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_with_retry_immediate_success() {
        let config = RetryConfig::fixed(3, Duration::from_millis(1));
        let result = with_retry(&config, "test", || async { Ok::<_, std::io::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_succeeds_on_third_attempt() {
        let config = RetryConfig::fixed(3, Duration::from_secs(5));
        let attempts = Arc::new(AtomicU32::new(0));

        let result = with_retry(&config, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 { Err(transient()) } else { Ok(7) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_all_fail() {
        let config = RetryConfig::fixed(3, Duration::from_secs(5));
        let attempts = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<i32, _> = with_retry(&config, "push", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("push failed after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_error() {
        let config = RetryConfig::fixed(3, Duration::from_millis(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<i32, _> = with_retry_if(
            &config,
            "test",
            |e: &std::io::Error| e.kind() != std::io::ErrorKind::InvalidData,
            || {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let config = RetryConfig::fixed(0, Duration::ZERO);
        let result = with_retry(&config, "test", || async { Ok::<_, std::io::Error>(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }
}
