//! Dispatch queue: the at-least-once channel between receivers and workers.
//!
//! A message carries only a task id. Delivery may be duplicated (visibility
//! timeout expiry, worker crash) and is unordered across tasks; workers absorb
//! duplicates through conditional transitions in the task store.

pub mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::TaskId;
use crate::retry::{Backoff, retry_transient};
use crate::telemetry::metrics;

/// One delivery of a queued task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker handle used to acknowledge this delivery.
    pub receipt: i64,
    pub task_id: TaskId,
    /// How many times this message has been handed out, including this one.
    pub read_count: u32,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Schedule delivery of `task_id` after `delay`.
    async fn enqueue(&self, task_id: TaskId, delay: Duration) -> Result<()>;

    /// Take the next visible message, hiding it for `visibility_timeout`.
    /// Unacked messages become visible again afterwards.
    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

/// Enqueue, retrying transient broker failures with backoff.
pub async fn enqueue_with_retry(
    queue: &dyn DispatchQueue,
    task_id: TaskId,
    delay: Duration,
    policy: Backoff,
) -> Result<()> {
    let result = retry_transient(policy, "queue.enqueue", || queue.enqueue(task_id, delay)).await;
    metrics::queue_operations().add(
        1,
        &[
            opentelemetry::KeyValue::new("operation", "enqueue"),
            opentelemetry::KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
        ],
    );
    result
}
