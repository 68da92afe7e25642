//! Retry with exponential backoff and jitter.
//!
//! One policy object covers every retried call: `max_attempts`, `base_delay`
//! and a `retry_if` predicate deciding which errors are worth another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub retry_if: fn(&E) -> bool,
}

// Manual impls: a derive would demand `E: Clone`.
impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .finish_non_exhaustive()
    }
}

/// Why a retried operation gave up.
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error; `last` is the final cause.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error the predicate refused to retry.
    Aborted(E),
}

impl<E> RetryPolicy<E> {
    pub fn new(max_attempts: u32, base_delay: Duration, retry_if: fn(&E) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            retry_if,
        }
    }

    /// Delay after the failed attempt with 0-based index `attempt`:
    /// `base * 2^attempt + jitter`, where `jitter` must lie in `[0, base)`.
    /// Keeping jitter below `base` makes successive delays strictly increasing.
    pub fn backoff(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).saturating_add(jitter)
    }

    fn random_jitter(&self) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Attempts run strictly one after another; `op`
    /// receives the 0-based attempt index.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.retry_if)(&err) {
                return Err(RetryError::Aborted(err));
            }

            if attempt + 1 >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }

            let delay = self.backoff(attempt, self.random_jitter());
            warn!(
                "Attempt {} of {} failed ({}), retrying after {}ms...",
                attempt + 1,
                self.max_attempts,
                err,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
