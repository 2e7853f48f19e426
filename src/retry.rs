//! Bounded retry with exponential backoff
//!
//! Storage is the only blocking point in the pipeline; transient SQLite
//! contention (busy/locked, pool timeout) is retried with jittered
//! exponential backoff. Anything else, and budget exhaustion, surfaces
//! to the caller.

use crate::error::{AppError, Result};
use rand::Rng;
use std::time::Duration;

/// Retry budget and backoff shape
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based), doubled each attempt,
    /// capped, with up to 25% jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        exp.mul_f64(1.0 + jitter)
    }
}

/// Run a storage operation under the retry policy.
///
/// Non-transient errors pass through untouched on the first failure.
/// Transient errors are retried; when the budget runs out the last error is
/// wrapped as `Persistence`, which callers treat as fatal.
pub fn with_retry<T, F>(policy: &RetryPolicy, op_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(AppError::Persistence(format!(
                        "{} failed after {} attempts: {}",
                        op_name, attempt, err
                    )));
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} transient failure (attempt {}/{}), retrying in {:?}: {}",
                    op_name,
                    attempt,
                    policy.max_attempts,
                    delay,
                    err
                );
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}
