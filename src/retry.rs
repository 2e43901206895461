//! Exponential backoff retry policy shared by every fetch.
//!
//! The main sweep, the compensation pass and the abstract retry command all
//! go through [`RetryPolicy::run`], so there is exactly one place that
//! decides how often and how long to wait.
//!
//! # Backoff Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=jitter)
//! ```
//!
//! Only [`FetchError::Transient`] failures are retried; a permanent failure
//! is returned straight away.

use crate::error::FetchError;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

/// Retry parameters, configurable from the YAML config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles after each failure.
    pub base_delay_ms: u64,
    /// Upper bound on the exponential part of the delay.
    pub max_delay_ms: u64,
    /// Random jitter added on top of each delay.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests and fixture-driven runs.
    #[cfg(test)]
    pub fn immediate(max_attempts: usize) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let delay = Duration::from_millis(self.base_delay_ms).saturating_mul(1 << shift);
        delay.min(Duration::from_millis(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    #[instrument(level = "debug", skip_all, fields(%label))]
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let total_t0 = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    let total_dt = total_t0.elapsed();

                    if !e.is_transient() {
                        warn!(attempt, error = %e, "permanent failure; not retrying");
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        error!(
                            attempt,
                            max = max_attempts,
                            elapsed_ms_total = total_dt.as_millis(),
                            error = %e,
                            "fetch exhausted retries"
                        );
                        return Err(e);
                    }

                    let jitter_ms: u64 = if self.jitter_ms > 0 {
                        rng().random_range(0..=self.jitter_ms)
                    } else {
                        0
                    };
                    let delay = self.backoff(attempt) + Duration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = max_attempts,
                        elapsed_ms_total = total_dt.as_millis(),
                        ?delay,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(60), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run("page 1", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FetchError::transient("page 1", "timeout"))
                    } else {
                        Ok("body")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("body"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<(), _> = policy
            .run("article", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::permanent("article", "HTTP 404")) }
            })
            .await;
        assert!(matches!(result, Err(FetchError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(2);
        let result: Result<(), _> = policy
            .run("page 9", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::transient("page 9", "connection reset")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
