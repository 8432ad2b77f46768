//! Bounded exponential backoff.
//!
//! Used for two things: retrying transient store/queue calls in place, and
//! choosing the redelivery delay for a task whose processing attempt failed.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Exponential backoff capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    /// Tries (including the first) before giving up in [`retry_transient`].
    pub max_tries: u32,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// For in-place retries of store and queue calls.
    pub fn transient() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_tries: 5,
        }
    }

    /// For redelivering a task after a failed processing attempt.
    pub fn redelivery() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            max_tries: 1,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or `policy.max_tries` is spent.
///
/// Only errors where [`crate::error::Error::is_transient`] holds are retried.
pub async fn retry_transient<T, F, Fut>(policy: Backoff, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && tries < policy.max_tries => {
                let delay = policy.delay(tries);
                warn!(operation, tries, delay_ms = delay.as_millis() as u64, "transient failure: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
