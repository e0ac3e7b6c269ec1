// ABOUTME: Exponential backoff with full jitter for retryable gRPC calls.
// ABOUTME: Retries only backoff-class failures, up to a fixed attempt ceiling.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, RetryClass};

/// Maximum number of attempts before giving up.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Configuration for retrying a call with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on every subsequent attempt.
    pub base_delay: Duration,
    /// Upper bound applied before jitter.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Set maximum attempts.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Upper bound of the wait after the given (zero-based) failed attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait after the given failed attempt: the ceiling scaled by `U[0, 1]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.ceiling(attempt).mul_f64(jitter)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt ceiling is reached. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let last = attempt + 1 >= max_attempts;
                if err.retry_class() != RetryClass::Backoff || last {
                    return Err(err);
                }

                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
