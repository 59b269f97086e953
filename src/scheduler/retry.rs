//! Retry policy for the quick screen.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How often to try an operation and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Upper bound on wall time when every attempt takes `per_attempt`.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        per_attempt
            .saturating_mul(self.max_attempts)
            .saturating_add(self.backoff.saturating_mul(self.max_attempts - 1))
    }

    /// Run `op` until it succeeds or attempts run out. `op` receives the
    /// 1-based attempt number. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    tracing::debug!(
                        "Retry: {} attempt {}/{} failed: {}",
                        label,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500))
    }
}
