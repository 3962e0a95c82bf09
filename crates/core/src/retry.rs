//! Bounded retry with exponential backoff and jitter.
//!
//! Delays grow exponentially from a base, are jittered by a uniform
//! 0.5x-1.5x factor, and are capped. A server-provided retry-after hint
//! overrides the computed delay when it is longer. Errors that are not
//! retryable (auth, protocol) abort immediately.

use crate::error::{PlatformError, PlatformResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy shared by REST call-sites and reconnect loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied after exponential growth.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given bounds.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Raw exponential delay for a zero-based retry attempt, before jitter.
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Jittered delay for a zero-based retry attempt (0.5x-1.5x of raw).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        raw.mul_f64(jitter).min(self.max_delay.mul_f64(1.5))
    }

    /// Runs `op` with retries.
    ///
    /// # Errors
    ///
    /// Returns the last error once the attempt budget is exhausted, or the
    /// first non-retryable error immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> PlatformResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlatformResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(error = %err, attempts = attempt, "retry budget exhausted");
                        return Err(err);
                    }
                    let mut delay = self.delay_for(attempt - 1);
                    if let Some(hint) = err.retry_delay_secs() {
                        let hinted = Duration::from_secs(hint);
                        if hinted > delay {
                            delay = hinted;
                        }
                    }
                    debug!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
