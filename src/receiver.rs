//! Receiver: admit one event descriptor and make sure a worker will see it.
//!
//! Validate, fingerprint, create-or-fetch, enqueue. Because create-or-fetch
//! is atomic in the store, a client that times out and resubmits gets the
//! same task back instead of a second one.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{Span, info, warn};

use crate::error::Result;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::model::{EventDescriptor, ReceiveTask, State, TaskId};
use crate::queue::{DispatchQueue, enqueue_with_retry};
use crate::retry::{Backoff, retry_transient};
use crate::store::{TaskStore, TransitionUpdate};
use crate::telemetry::metrics;
use crate::telemetry::task::record_state_transition;

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// The task as of acceptance. For a new task this is the RECEIVED row.
    pub task: ReceiveTask,
    /// False when the fingerprint was already known.
    pub created: bool,
}

#[derive(Clone)]
pub struct Receiver {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    transient: Backoff,
}

impl Receiver {
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn DispatchQueue>) -> Self {
        Self {
            store,
            queue,
            transient: Backoff::transient(),
        }
    }

    pub fn with_backoff(mut self, transient: Backoff) -> Self {
        self.transient = transient;
        self
    }

    /// Accept a raw JSON event descriptor.
    pub async fn receive(&self, body: serde_json::Value) -> Result<Receipt> {
        let descriptor = EventDescriptor::from_json(body).inspect_err(|_| {
            metrics::tasks_received().add(1, &[KeyValue::new("result", "invalid")]);
        })?;
        let fp = fingerprint(&descriptor);

        let (task, created) = retry_transient(self.transient, "store.create_or_fetch", || {
            self.store.create_or_fetch(&fp, descriptor.raw())
        })
        .await?;

        // A known task still in RECEIVED may be one whose enqueue failed
        // earlier; enqueue again. Workers absorb the spare message.
        if created || task.state == State::Received {
            self.dispatch(task.id).await?;
        }

        metrics::tasks_received().add(
            1,
            &[KeyValue::new("result", if created { "created" } else { "duplicate" })],
        );
        info!(task_id = %task.id, fingerprint = %fp, created, state = %task.state, "event received");
        Ok(Receipt { task, created })
    }

    async fn dispatch(&self, id: TaskId) -> Result<()> {
        enqueue_with_retry(self.queue.as_ref(), id, Duration::ZERO, self.transient).await?;

        let queued = retry_transient(self.transient, "store.transition", || {
            self.store
                .transition(id, State::Received, State::Queued, TransitionUpdate::none())
        })
        .await;
        match queued {
            Ok(true) => record_state_transition(&Span::current(), State::Received, State::Queued),
            // A worker already took it.
            Ok(false) => {}
            // The message is out; the worker promotes RECEIVED itself.
            Err(e) => warn!(task_id = %id, "could not mark task queued: {e}"),
        }
        Ok(())
    }

    pub async fn status(&self, id: TaskId) -> Result<ReceiveTask> {
        retry_transient(self.transient, "store.get", || self.store.get(id)).await
    }

    pub async fn status_by_fingerprint(&self, fp: &Fingerprint) -> Result<ReceiveTask> {
        retry_transient(self.transient, "store.get_by_fingerprint", || {
            self.store.get_by_fingerprint(fp)
        })
        .await
    }

    pub async fn health(&self) -> Result<()> {
        self.store.health_check().await
    }
}
