//! pgmq dispatch queue via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive. A read hides the message for the visibility timeout; an
//! unarchived message reappears afterwards, which is where at-least-once
//! redelivery comes from.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::warn;
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::TaskId;
use crate::queue::{Delivery, DispatchQueue};
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PgmqMessage {
    msg_id: i64,
    read_ct: i32,
    message: serde_json::Value,
}

/// Dispatch queue backed by a pgmq queue.
#[derive(Clone)]
pub struct PgmqQueue {
    db: Db,
    queue_name: String,
}

impl PgmqQueue {
    pub fn new(db: Db, queue_name: impl Into<String>) -> Self {
        Self {
            db,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Create the pgmq queue (idempotent).
    pub async fn create(&self) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.queue_name)
            .execute(self.db.pool())
            .await
            .map_err(queue_err)?;
        self.record("create");
        Ok(())
    }

    async fn archive(&self, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&self.queue_name)
            .bind(msg_id)
            .execute(self.db.pool())
            .await
            .map_err(queue_err)?;
        self.record("archive");
        Ok(())
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue_name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

#[async_trait]
impl DispatchQueue for PgmqQueue {
    async fn enqueue(&self, task_id: TaskId, delay: Duration) -> Result<()> {
        let payload = serde_json::json!({ "task_id": task_id.0 });
        let delay_seconds = i32::try_from(delay.as_secs()).unwrap_or(i32::MAX);
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(&self.queue_name)
            .bind(&payload)
            .bind(delay_seconds)
            .execute(self.db.pool())
            .await
            .map_err(queue_err)?;
        self.record("send");
        Ok(())
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        let vt_seconds = i32::try_from(visibility_timeout.as_secs().max(1)).unwrap_or(i32::MAX);
        loop {
            let msg: Option<PgmqMessage> =
                sqlx::query_as("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)")
                    .bind(&self.queue_name)
                    .bind(vt_seconds)
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(queue_err)?;

            let Some(msg) = msg else {
                self.record("read_empty");
                return Ok(None);
            };
            self.record("read");

            let task_id = msg
                .message
                .get("task_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());

            match task_id {
                Some(id) => {
                    return Ok(Some(Delivery {
                        receipt: msg.msg_id,
                        task_id: TaskId(id),
                        read_count: u32::try_from(msg.read_ct).unwrap_or(0),
                    }));
                }
                None => {
                    // Nothing can ever process it; keep it for audit and move on.
                    warn!(msg_id = msg.msg_id, message = %msg.message, "bad pgmq payload: missing task_id, archiving");
                    self.archive(msg.msg_id).await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.archive(delivery.receipt).await
    }
}

/// Connectivity failures on the broker are queue outages, not store outages.
fn queue_err(e: sqlx::Error) -> Error {
    match Error::from(e) {
        Error::StoreUnavailable(msg) => Error::QueueUnavailable(msg),
        other => other,
    }
}
