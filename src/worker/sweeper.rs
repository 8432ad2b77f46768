//! Sweeper: periodic reconciliation for tasks the queue lost track of.
//!
//! - RECEIVED past `orphan_after`: the receiver's enqueue never landed.
//!   Enqueue, then RECEIVED -> QUEUED.
//! - PROCESSING past the lease: the worker holding it died. Counted as a
//!   failed attempt and retried or failed like any other.
//! - QUEUED past `requeue_after`: its message may be gone. Enqueue again;
//!   a spare message is absorbed as a duplicate.
//!
//! Every move is conditional, so several sweepers and workers may run at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{Span, debug, error, info, info_span, warn};

use super::Worker;
use crate::error::{Error, Result};
use crate::model::{ReceiveTask, State};
use crate::processor::ProcessingError;
use crate::queue::enqueue_with_retry;
use crate::retry::retry_transient;
use crate::store::TransitionUpdate;
use crate::telemetry::metrics;

/// Counts from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub orphans_queued: usize,
    pub leases_recovered: usize,
    pub requeued: usize,
    /// Tasks another component moved first.
    pub skipped: usize,
    /// Tasks whose step errored; the next sweep tries them again.
    pub failed: usize,
}

impl SweepReport {
    /// Count a lost race as skipped and an error as failed. True when the step was done.
    fn settle(&mut self, task: &ReceiveTask, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(Error::StaleState { .. }) => {
                self.skipped += 1;
                false
            }
            Err(e) => {
                warn!(task_id = %task.id, state = %task.state, "sweep step failed: {e}");
                self.failed += 1;
                false
            }
        }
    }
}

pub struct Sweeper {
    worker: Arc<Worker>,
}

impl Sweeper {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// Sweep every `sweep_interval` until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.worker.config().sweep_interval;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let report = self.sweep_once().await;
            if report.failed > 0 {
                error!(?report, "sweep finished with failures");
            } else if report != SweepReport::default() {
                info!(?report, "sweep finished");
            } else {
                debug!("sweep found nothing");
            }
        }
        info!("sweeper shutting down");
    }

    /// One pass over every stale state. A failure on one task or state does
    /// not stop the others.
    pub async fn sweep_once(&self) -> SweepReport {
        let config = self.worker.config();
        let mut report = SweepReport::default();

        for task in self.stale(&mut report, State::Received, config.orphan_after).await {
            let result = self.queue_orphan(&task).await;
            if report.settle(&task, result) {
                report.orphans_queued += 1;
            }
        }
        for task in self.stale(&mut report, State::Processing, config.lease()).await {
            let result = self.recover_lease(&task).await;
            if report.settle(&task, result) {
                report.leases_recovered += 1;
            }
        }
        for task in self.stale(&mut report, State::Queued, config.requeue_after).await {
            let result = self.requeue(&task).await;
            if report.settle(&task, result) {
                report.requeued += 1;
            }
        }
        report
    }

    async fn stale(&self, report: &mut SweepReport, state: State, age: Duration) -> Vec<ReceiveTask> {
        let config = self.worker.config();
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::TimeDelta::MAX);
        let found = retry_transient(config.transient, "store.stale", || {
            self.worker.store().stale(state, cutoff, config.sweep_batch)
        })
        .await;
        found.unwrap_or_else(|e| {
            warn!(%state, "cannot list stale tasks: {e}");
            report.failed += 1;
            Vec::new()
        })
    }

    async fn queue_orphan(&self, task: &ReceiveTask) -> Result<()> {
        let config = self.worker.config();
        enqueue_with_retry(self.worker.queue(), task.id, Duration::ZERO, config.transient).await?;
        let span = sweep_span(task);
        if !self
            .worker
            .advance(&span, task.id, State::Received, State::Queued, TransitionUpdate::none())
            .await?
        {
            // A worker picked up the message first; it did the promotion.
            return Err(Error::StaleState {
                id: task.id.to_string(),
                expected: State::Received,
            });
        }
        metrics::tasks_swept().add(1, &[KeyValue::new("reason", "orphaned")]);
        info!(task_id = %task.id, "orphaned task queued");
        Ok(())
    }

    async fn recover_lease(&self, task: &ReceiveTask) -> Result<()> {
        let span = sweep_span(task);
        let disposition = self
            .worker
            .settle_failure(
                &span,
                task.id,
                task.attempt_count,
                &ProcessingError::retryable("processing lease expired"),
            )
            .await?;
        if disposition == super::Disposition::Superseded {
            return Err(Error::StaleState {
                id: task.id.to_string(),
                expected: State::Processing,
            });
        }
        metrics::tasks_swept().add(1, &[KeyValue::new("reason", "lease_expired")]);
        info!(task_id = %task.id, ?disposition, "abandoned attempt recovered");
        Ok(())
    }

    /// Enqueue a long-QUEUED task again and restart its `requeue_after` clock,
    /// so the next sweeps leave it alone while the new message is pending.
    async fn requeue(&self, task: &ReceiveTask) -> Result<()> {
        let config = self.worker.config();
        enqueue_with_retry(self.worker.queue(), task.id, Duration::ZERO, config.transient).await?;
        let touched = retry_transient(config.transient, "store.touch", || {
            self.worker.store().touch(task.id, State::Queued)
        })
        .await?;
        if !touched {
            // Claimed in the meantime; the new message is a spare duplicate.
            return Err(Error::StaleState {
                id: task.id.to_string(),
                expected: State::Queued,
            });
        }
        metrics::tasks_swept().add(1, &[KeyValue::new("reason", "requeued")]);
        debug!(task_id = %task.id, "long-queued task enqueued again");
        Ok(())
    }
}

fn sweep_span(task: &ReceiveTask) -> Span {
    info_span!("task.sweep", "task.id" = %task.id, "task.state" = tracing::field::Empty)
}
