//! Backoff for configuration store reads
//!
//! The watcher has to outlive any store outage, so reads retry forever by
//! default. Only failures that [`Error::is_retryable`] accepts are retried;
//! anything else goes straight back to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::{Error, Result};

/// How store reads back off between attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Ceiling for the doubled delay
    pub max_delay: Duration,
    /// Give up after this many attempts; None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever()
    }
}

impl RetryPolicy {
    /// Retry until the store answers
    pub fn forever() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    /// Stop after `attempts` attempts
    pub fn limited(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
            ..Self::forever()
        }
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Spread a delay over 0.5x to 1.5x so replicas do not hit the store in lockstep
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Run a store operation, backing off between retryable failures
pub async fn retry_store<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut attempt_once: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err: Error = match attempt_once().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(operation, attempt, error = %err, "Store operation failed permanently");
            return Err(err);
        }
        if policy.exhausted(attempt) {
            error!(operation, attempt, error = %err, "Store operation failed after max retries");
            return Err(err);
        }

        let delay = jittered(policy.delay_after(attempt));
        warn!(
            operation,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Store operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
