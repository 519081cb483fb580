//! Retry helpers.
//!
//! Two policies live here. Store conflicts are retried immediately with
//! a fresh read, bounded only by the pass deadline. Collaborator I/O is
//! retried with exponential backoff and jitter, bounded by an attempt
//! count.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FailoverResult;

/// Backoff settings for collaborator calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (at least one is always made).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is used up.
///
/// Delays grow by `backoff_multiplier` up to `max_delay`, with 0.5x..1.5x
/// jitter. Returns the last error on exhaustion.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max attempts"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Re-run a read-modify-write `operation` while it loses compare-and-swap
/// races. There is no attempt cap; `deadline` bounds the loop.
pub async fn retry_on_conflict<F, Fut, T>(
    deadline: Instant,
    operation_name: &str,
    mut operation: F,
) -> FailoverResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FailoverResult<T>>,
{
    let mut conflicts = 0u32;
    loop {
        match operation().await {
            Err(e) if e.is_conflict() => {
                conflicts += 1;
                if Instant::now() >= deadline {
                    warn!(operation = %operation_name, conflicts, "conflict retries exhausted the deadline");
                    return Err(e);
                }
                debug!(operation = %operation_name, conflicts, "write conflicted, re-reading");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
