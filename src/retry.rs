//! Retry execution with capped exponential backoff
//!
//! One policy drives all retryable operations: exchanges, parse retries, and
//! session reattachment each get their own attempt budget but share the same
//! backoff curve. Fatal and cancelled errors short-circuit the loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ExtractError;

/// Fraction of the backoff delay added as random jitter.
const JITTER_FRACTION: f64 = 0.25;

/// Retry helper bound to one attempt budget.
pub struct RetryHelper {
    config: RetryConfig,
    max_attempts: u32,
}

impl RetryHelper {
    /// Helper using the main per-task attempt budget.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            max_attempts: config.max_attempts,
        }
    }

    /// Helper with an explicit budget (parse retries, attach retries).
    pub fn with_budget(config: &RetryConfig, max_attempts: u32) -> Self {
        Self {
            config: config.clone(),
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Execute an operation with retries and jittered backoff.
    ///
    /// The operation is called at most `max_attempts` times. Errors that are
    /// not retryable (fatal persistence/session errors, cancellation) are
    /// returned immediately. The backoff before attempt n is the configured
    /// exponential delay plus up to 25% jitter, and the sleep itself aborts
    /// with `Cancelled` when the token fires.
    pub async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ExtractError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let mut attempt = 0u32;
        let mut last_err: Option<ExtractError> = None;

        while attempt < self.max_attempts {
            attempt += 1;

            if attempt > 1 {
                let delay = jittered(self.config.calculate_backoff_delay(attempt));
                debug!(attempt, ?delay, "backing off before retry");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
                }
            }

            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }

            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt, max = self.max_attempts, error = %e, "attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(ExtractError::Cancelled))
    }
}

/// Add up to 25% random jitter so parallel retries do not synchronize.
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let jitter_ms = (delay.as_millis() as f64 * JITTER_FRACTION * fastrand::f64()) as u64;
    delay + Duration::from_millis(jitter_ms)
}
