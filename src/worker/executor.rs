//! Worker executor: turns one queue delivery into at most one processing
//! attempt.
//!
//! Every state change is a conditional transition, so any number of workers
//! (and sweepers) racing on the same task converge: one wins each edge, the
//! rest observe `false` and back off. That is what absorbs at-least-once
//! redelivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info, warn};

use super::WorkerConfig;
use crate::error::{Error, Result};
use crate::model::{ReceiveTask, State, TaskId};
use crate::processor::{ProcessingError, Processor};
use crate::queue::{Delivery, DispatchQueue, enqueue_with_retry};
use crate::retry::retry_transient;
use crate::store::{TaskStore, TransitionUpdate};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// What a worker did with a delivery. The delivery is acked in every case
/// except when `handle` returns an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processing succeeded; task is COMPLETED.
    Completed,
    /// Attempt failed; task is QUEUED again and redelivery is scheduled.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted or the failure is permanent; task is FAILED.
    Failed { attempts: u32 },
    /// Task was already past QUEUED; nothing was processed.
    Duplicate { state: State },
    /// Another worker or the sweeper moved the task while this one held it.
    Superseded,
    /// No task with the delivered id.
    Missing,
}

pub struct Worker {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        processor: Arc<dyn Processor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn TaskStore {
        self.store.as_ref()
    }

    pub(crate) fn queue(&self) -> &dyn DispatchQueue {
        self.queue.as_ref()
    }

    /// Dequeue one message and handle it. `None` when the queue is empty.
    pub async fn poll_once(&self) -> Result<Option<Disposition>> {
        let delivery = retry_transient(self.config.transient, "queue.dequeue", || {
            self.queue.dequeue(self.config.visibility_timeout)
        })
        .await?;

        match delivery {
            Some(delivery) => self.handle(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one delivery and ack it.
    ///
    /// On `Err` the delivery is left unacked so the visibility timeout hands
    /// it out again.
    pub async fn handle(&self, delivery: &Delivery) -> Result<Disposition> {
        let span = start_task_span(delivery.task_id, delivery.read_count);
        let disposition = self
            .execute(&span, delivery.task_id)
            .instrument(span.clone())
            .await?;

        retry_transient(self.config.transient, "queue.ack", || self.queue.ack(delivery)).await?;
        debug!(parent: &span, ?disposition, "delivery acked");
        Ok(disposition)
    }

    async fn execute(&self, span: &Span, id: TaskId) -> Result<Disposition> {
        let task = match self.fetch(id).await {
            Ok(task) => task,
            Err(Error::NotFound(_)) => {
                warn!(task_id = %id, "delivered task does not exist, dropping");
                return Ok(Disposition::Missing);
            }
            Err(e) => return Err(e),
        };

        if task.state == State::Received {
            // The receiver's own RECEIVED -> QUEUED may not have landed yet.
            self.advance(span, id, State::Received, State::Queued, TransitionUpdate::none())
                .await?;
        }

        if !self
            .advance(
                span,
                id,
                State::Queued,
                State::Processing,
                TransitionUpdate::begin_attempt(),
            )
            .await?
        {
            return self.absorb_duplicate(span, id).await;
        }

        let task = self.fetch(id).await?;
        let attempt = task.attempt_count;
        info!(task_id = %id, attempt, max_attempts = self.config.max_attempts, "processing");

        match self.attempt(&task).await {
            Ok(()) => {
                if self
                    .advance(
                        span,
                        id,
                        State::Processing,
                        State::Completed,
                        TransitionUpdate::none(),
                    )
                    .await?
                {
                    info!(task_id = %id, attempt, "task completed");
                    Ok(Disposition::Completed)
                } else {
                    warn!(task_id = %id, "lease lost before completion was recorded");
                    Ok(Disposition::Superseded)
                }
            }
            Err(e) => {
                warn!(task_id = %id, attempt, retryable = e.retryable, error = %e, "processing failed");
                self.settle_failure(span, id, attempt, &e).await
            }
        }
    }

    /// Run the processor once under the processing timeout.
    async fn attempt(&self, task: &ReceiveTask) -> std::result::Result<(), ProcessingError> {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.processing_timeout, self.processor.process(&task.payload))
                .await;

        let (result, label) = match outcome {
            Ok(Ok(())) => (Ok(()), "ok"),
            Ok(Err(e)) => (Err(e), "error"),
            Err(_) => (
                Err(ProcessingError::retryable(format!(
                    "processing timed out after {}s",
                    self.config.processing_timeout.as_secs()
                ))),
                "timeout",
            ),
        };
        metrics::processing_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("outcome", label)],
        );
        result
    }

    /// Move a PROCESSING task that just failed attempt number `attempts` to
    /// QUEUED (with a delayed redelivery) or FAILED.
    pub(crate) async fn settle_failure(
        &self,
        span: &Span,
        id: TaskId,
        attempts: u32,
        error: &ProcessingError,
    ) -> Result<Disposition> {
        let update = TransitionUpdate::with_error(error.message.clone());

        if error.retryable && attempts < self.config.max_attempts {
            if !self
                .advance(span, id, State::Processing, State::Queued, update)
                .await?
            {
                return Ok(Disposition::Superseded);
            }
            let delay = self.config.redelivery.delay(attempts);
            // If this fails the caller leaves its delivery unacked, and that
            // message brings the now-QUEUED task back.
            enqueue_with_retry(self.queue.as_ref(), id, delay, self.config.transient).await?;
            info!(task_id = %id, attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
            Ok(Disposition::Retrying {
                attempt: attempts,
                delay,
            })
        } else {
            if !self
                .advance(span, id, State::Processing, State::Failed, update)
                .await?
            {
                return Ok(Disposition::Superseded);
            }
            warn!(task_id = %id, attempts, retryable = error.retryable, "task failed");
            Ok(Disposition::Failed { attempts })
        }
    }

    /// The task was not in QUEUED. Either a duplicate, or an abandoned attempt
    /// whose message came back after the worker holding it died.
    async fn absorb_duplicate(&self, span: &Span, id: TaskId) -> Result<Disposition> {
        let current = self.fetch(id).await?;
        let lease = chrono::Duration::from_std(self.config.lease()).unwrap_or(chrono::TimeDelta::MAX);

        if current.state == State::Processing && Utc::now() - current.updated_at > lease {
            warn!(task_id = %id, attempt = current.attempt_count, "processing lease expired, recovering");
            return self
                .settle_failure(
                    span,
                    id,
                    current.attempt_count,
                    &ProcessingError::retryable("processing lease expired"),
                )
                .await;
        }

        metrics::duplicate_deliveries().add(1, &[KeyValue::new("state", current.state.as_str())]);
        debug!(task_id = %id, state = %current.state, "duplicate delivery");
        Ok(Disposition::Duplicate {
            state: current.state,
        })
    }

    async fn fetch(&self, id: TaskId) -> Result<ReceiveTask> {
        retry_transient(self.config.transient, "store.get", || self.store.get(id)).await
    }

    /// Conditional transition with transient retries; records the edge when won.
    pub(crate) async fn advance(
        &self,
        span: &Span,
        id: TaskId,
        from: State,
        to: State,
        update: TransitionUpdate,
    ) -> Result<bool> {
        let won = retry_transient(self.config.transient, "store.transition", || {
            self.store.transition(id, from, to, update.clone())
        })
        .await?;
        if won {
            record_state_transition(span, from, to);
        } else {
            debug!(task_id = %id, from = %from, to = %to, "transition lost");
        }
        Ok(won)
    }
}
