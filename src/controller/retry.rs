//! Bounded retry of writes that lose an optimistic-concurrency race.
//!
//! Only conflicts (HTTP 409) are retried here. Every other store error is
//! handed straight back to the caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::controller::error::{Error, is_conflict};

/// Errors that can signal an optimistic-concurrency conflict.
pub trait Conflict {
    fn is_conflict(&self) -> bool;
}

impl Conflict for kube::Error {
    fn is_conflict(&self) -> bool {
        is_conflict(self)
    }
}

impl Conflict for Error {
    fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(e) if is_conflict(e))
    }
}

/// Backoff settings for conflict retries.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No sleeping between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// Outcome of [`retry_on_conflict`] when it does not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt conflicted.
    Exhausted { attempts: u32, last: E },
    /// A non-conflict error, returned on first sight.
    Failed(E),
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is spent. The operation is expected to re-read the object
/// it writes so each attempt carries a fresh resource version.
pub async fn retry_on_conflict<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Conflict,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_conflict() => return Err(RetryError::Failed(e)),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = jittered_delay.as_millis(),
                    "Write conflicted, retrying"
                );

                if !jittered_delay.is_zero() {
                    tokio::time::sleep(jittered_delay).await;
                }
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
