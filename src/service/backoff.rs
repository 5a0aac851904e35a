//! Bounded exponential backoff for transient storage errors.

use crate::config::BackoffConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    initial: Duration,
    max_interval: Duration,
    max_elapsed: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max_interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial,
            max_interval,
            max_elapsed,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// elapsed budget runs out (the last error is returned).
    ///
    /// The delay doubles after each attempt, capped at the max interval.
    /// Cancelling `ctx` ends the wait with [`Error::Cancelled`].
    pub fn retry<T>(&self, ctx: &Context, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.max_elapsed;
        let mut delay = self.initial;
        let mut attempt = 1u32;

        loop {
            if ctx.is_done() {
                return Err(Error::Cancelled);
            }
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            let now = Instant::now();
            if now + delay > deadline {
                debug!(attempt, error = %err, "giving up after retries");
                return Err(err);
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            if !ctx.sleep(delay) {
                return Err(Error::Cancelled);
            }
            delay = (delay * 2).min(self.max_interval);
            attempt += 1;
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_interval_ms),
            Duration::from_millis(config.max_elapsed_ms),
        )
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}
