//! Bounded retry with exponential backoff and jitter.
//!
//! Optimistic-concurrency writes are retried by re-running the whole
//! get-modify-write cycle, never by replaying a write with a stale
//! resourceVersion. The policy is plain data so callers can take it from
//! configuration.
//!
//! ```ignore
//! let nas = retry_on_conflict(&policy, &cancel, "set-status", || async {
//!     let nas = client.get_or_create().await?;
//!     client.update_status(&nas, NodeAllocationStateStatus::Ready).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{OperatorError, Result};

/// How often and how patiently an operation is retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1 is always made
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay before jitter
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt
    pub backoff_multiplier: f64,
    /// Fraction of the delay added at random, 0.1 = up to +10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter. `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(63) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Retries `operation` while it fails with `Conflict`.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(
        policy,
        cancel,
        operation_name,
        OperatorError::is_conflict,
        operation,
    )
    .await
}

/// Retries `operation` while `should_retry` holds for its error.
///
/// Errors the predicate rejects are returned as they are. Running out of
/// attempts yields `RetriesExhausted` wrapping the last error; cancellation
/// yields `Cancelled` without starting another attempt.
pub async fn retry_if<F, Fut, T, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&OperatorError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(OperatorError::Cancelled(operation_name.to_string()));
        }
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempts = attempt,
                error = %err,
                "Retry budget exhausted"
            );
            return Err(OperatorError::RetriesExhausted {
                operation: operation_name.to_string(),
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = policy.jittered(policy.backoff(attempt));
        debug!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(OperatorError::Cancelled(operation_name.to_string()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
