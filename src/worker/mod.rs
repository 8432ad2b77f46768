//! Worker side of the pipeline: execute deliveries, run the pool, sweep.

pub mod executor;
pub mod pool;
pub mod sweeper;

pub use executor::{Disposition, Worker};
pub use pool::WorkerPool;
pub use sweeper::{SweepReport, Sweeper};

use std::time::Duration;

use crate::config::Config;
use crate::retry::Backoff;

/// Tuning for workers and the sweeper. Derived once from [`Config`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Attempts before a task is marked failed.
    pub max_attempts: u32,
    /// Upper bound on one processing attempt.
    pub processing_timeout: Duration,
    /// How long a dequeued message stays hidden. Longer than an attempt.
    pub visibility_timeout: Duration,
    /// Slack past `processing_timeout` before a PROCESSING task counts as abandoned.
    pub lease_grace: Duration,
    /// Idle wait between empty dequeues.
    pub poll_interval: Duration,
    /// Delay schedule for redelivering failed attempts.
    pub redelivery: Backoff,
    /// In-place retries of store and queue calls.
    pub transient: Backoff,
    /// RECEIVED tasks older than this are re-enqueued by the sweeper.
    pub orphan_after: Duration,
    /// QUEUED tasks untouched for this long are re-enqueued by the sweeper.
    pub requeue_after: Duration,
    pub sweep_interval: Duration,
    /// Tasks examined per sweep and state.
    pub sweep_batch: i64,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            processing_timeout: config.processing_timeout,
            visibility_timeout: config.processing_timeout.saturating_add(Duration::from_secs(60)),
            ..Self::default()
        }
    }

    /// Age at which a PROCESSING task's attempt is presumed dead.
    pub fn lease(&self) -> Duration {
        self.processing_timeout.saturating_add(self.lease_grace)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let processing_timeout = Duration::from_secs(crate::config::DEFAULT_PROCESSING_TIMEOUT_SECS);
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            processing_timeout,
            visibility_timeout: processing_timeout + Duration::from_secs(60),
            lease_grace: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            redelivery: Backoff::redelivery(),
            transient: Backoff::transient(),
            orphan_after: Duration::from_secs(30),
            requeue_after: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            sweep_batch: 100,
        }
    }
}
