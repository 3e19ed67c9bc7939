//! Bounded exponential-backoff retry around one idempotent operation

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RetryError;

/// Retry configuration.
///
/// The delay before retry `n` (1-based) is
/// `min(base_delay * multiplier^(n-1), max_delay)`. Which failures are
/// retried is decided per call by a predicate, so the policy does not
/// depend on any particular error type.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// Single attempt, never waits.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Waits between consecutive attempts, in order. Has `max_attempts - 1`
    /// entries.
    pub fn delays(&self) -> Vec<Duration> {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.multiplier)
            .with_max_times(retries)
            .build()
            .map(|delay| delay.min(self.max_delay))
            .take(retries)
            .collect()
    }

    /// Run `op` until it succeeds, fails terminally, runs out of attempts,
    /// or `cancel` fires during a backoff wait.
    pub async fn run<T, E, Op, Fut, P>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        is_retryable: P,
        mut op: Op,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut delays = self.delays().into_iter();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = %label, attempt, "RetryPolicy: {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                warn!(
                    op = %label,
                    attempt,
                    error = %error,
                    "RetryPolicy: {} failed terminally on attempt {}: {}",
                    label,
                    attempt,
                    error
                );
                return Err(RetryError::Terminal {
                    attempts: attempt,
                    error,
                });
            }

            let Some(delay) = delays.next() else {
                warn!(
                    op = %label,
                    attempt,
                    error = %error,
                    "RetryPolicy: {} exhausted {} attempts: {}",
                    label,
                    attempt,
                    error
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            };

            warn!(
                op = %label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "RetryPolicy: {} attempt {} failed, retrying in {:?}: {}",
                label,
                attempt,
                delay,
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(op = %label, attempt, "RetryPolicy: {} cancelled during backoff", label);
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last: Some(error),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
