//! Retry with exponential backoff for idempotent remote operations.

use std::future::Future;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};

/// Retry configuration for operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor);
        std::cmp::min(self.max_delay, delay)
    }
}

/// Execute an async operation with retry logic.
///
/// Only errors accepted by `retryable` are retried; anything else is
/// returned immediately.
///
/// # Errors
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub async fn with_retry_async<T, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts || !retryable(&e) {
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                info!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
