//! Bounded waiting
//!
//! Nothing in this crate blocks without a deadline. Conditions are polled
//! with a sleep between checks and the wait fails once the timeout passes.
//! Retry delays grow exponentially up to a cap, and the number of attempts is
//! bounded.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("condition not met within {0:?}")]
pub struct WaitTimeout(pub Duration);

/// Poll `condition` every `interval` until it holds or `timeout` elapses.
///
/// The condition is always checked at least once, and once more at the
/// deadline.
pub fn poll_until<F>(timeout: Duration, interval: Duration, mut condition: F) -> Result<(), WaitTimeout>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitTimeout(timeout));
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

/// Bounded exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the delay after the
    /// first failure is `backoff(1)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
