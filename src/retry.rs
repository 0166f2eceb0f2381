//! Bounded retry with exponential backoff and jitter.
//!
//! Used for the MachineSet fetch-decide-write sequence: a version conflict or
//! a transient store failure re-runs the whole sequence against a freshly
//! fetched object. Only
//! errors the caller classifies as retryable are retried; everything else is
//! returned immediately so the controller's error policy can take over.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff parameters for a retried operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff with a specific attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// No delay between attempts (tests)
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// Outcome of an exhausted or aborted retry loop
#[derive(Debug, PartialEq, Eq)]
pub struct RetryError<E> {
    /// The last error returned by the operation
    pub last: E,
    /// How many attempts were made
    pub attempts: u32,
    /// True when the budget ran out on retryable errors
    pub exhausted: bool,
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// attempt budget is spent.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    mut should_retry: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            debug!(operation = %operation_name, attempt, error = %err, "non-retryable failure");
            return Err(RetryError {
                last: err,
                attempts: attempt,
                exhausted: false,
            });
        }

        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "retry budget exhausted"
            );
            return Err(RetryError {
                last: err,
                attempts: attempt,
                exhausted: true,
            });
        }

        // 0.5x to 1.5x jitter so concurrent writers don't retry in lockstep
        let jittered = if delay.is_zero() {
            Duration::ZERO
        } else {
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(delay.as_secs_f64() * jitter)
        };

        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis() as u64,
            "retrying"
        );

        if !jittered.is_zero() {
            tokio::time::sleep(jittered).await;
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
