//! Exponential backoff for model downloads.

use std::future::Future;
use std::time::Duration;

/// How many times a download attempt is repeated and how long to wait between
/// repetitions. The delay doubles after every failure up to `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based). The first attempt
    /// never waits.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(31);
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds or the attempts are used up,
    /// returning the last error.
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= attempts => {
                    tracing::error!(operation = operation_name, attempt, error = %e, "giving up after max attempts");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.backoff_before(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
