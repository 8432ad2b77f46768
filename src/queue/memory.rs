//! In-process dispatch queue with visibility timeouts.
//!
//! Mirrors pgmq's delivery model: `dequeue` hides a message rather than
//! removing it, and only `ack` removes it. Time comes from `tokio::time`, so
//! tests can drive redelivery with a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Delivery, DispatchQueue};
use crate::error::{Error, Result};
use crate::model::TaskId;

struct Message {
    receipt: i64,
    task_id: TaskId,
    visible_at: Instant,
    read_count: u32,
}

#[derive(Default)]
struct Inner {
    messages: Vec<Message>,
    next_receipt: i64,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    fail_next_enqueues: AtomicU32,
    enqueued_total: AtomicU32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` enqueue calls fail with [`Error::QueueUnavailable`].
    pub fn fail_next_enqueues(&self, n: u32) {
        self.fail_next_enqueues.store(n, Ordering::SeqCst);
    }

    /// Messages not yet acked, visible or not.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful enqueue calls since creation.
    pub fn enqueued_total(&self) -> u32 {
        self.enqueued_total.load(Ordering::SeqCst)
    }

    /// Task ids of unacked messages, in enqueue order.
    pub fn pending(&self) -> Vec<TaskId> {
        self.lock().messages.iter().map(|m| m.task_id).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn enqueue(&self, task_id: TaskId, delay: Duration) -> Result<()> {
        let injected = self
            .fail_next_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::QueueUnavailable("injected failure".to_string()));
        }

        let mut inner = self.lock();
        inner.next_receipt += 1;
        let receipt = inner.next_receipt;
        inner.messages.push(Message {
            receipt,
            task_id,
            visible_at: Instant::now() + delay,
            read_count: 0,
        });
        self.enqueued_total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut inner = self.lock();
        let next = inner
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| (m.visible_at, m.receipt));

        Ok(next.map(|m| {
            m.visible_at = now + visibility_timeout;
            m.read_count += 1;
            Delivery {
                receipt: m.receipt,
                task_id: m.task_id,
                read_count: m.read_count,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.lock()
            .messages
            .retain(|m| m.receipt != delivery.receipt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn unacked_messages_are_redelivered() {
        let queue = MemoryQueue::new();
        let id = TaskId::new();
        queue.enqueue(id, Duration::ZERO).await.unwrap();

        let first = queue.dequeue(VT).await.unwrap().unwrap();
        assert_eq!(first.task_id, id);
        assert_eq!(first.read_count, 1);
        assert!(queue.dequeue(VT).await.unwrap().is_none());

        tokio::time::advance(VT + Duration::from_secs(1)).await;
        let again = queue.dequeue(VT).await.unwrap().unwrap();
        assert_eq!(again.receipt, first.receipt);
        assert_eq!(again.read_count, 2);

        queue.ack(&again).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_messages_wait() {
        let queue = MemoryQueue::new();
        queue.enqueue(TaskId::new(), Duration::from_secs(5)).await.unwrap();
        assert!(queue.dequeue(VT).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.dequeue(VT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn injected_enqueue_failures_are_transient() {
        let queue = MemoryQueue::new();
        queue.fail_next_enqueues(1);
        let err = queue.enqueue(TaskId::new(), Duration::ZERO).await.unwrap_err();
        assert!(err.is_transient());
        queue.enqueue(TaskId::new(), Duration::ZERO).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.enqueued_total(), 1);
    }
}
