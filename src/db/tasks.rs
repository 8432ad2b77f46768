//! Postgres task store: receive-task rows keyed by a unique fingerprint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{ReceiveTask, State, TaskId};
use crate::store::{TaskFilter, TaskStore, TransitionUpdate, validate_transition};

const COLUMNS: &str =
    "id, fingerprint, state, payload, attempt_count, last_error, created_at, updated_at";

#[async_trait]
impl TaskStore for Db {
    async fn create_or_fetch(
        &self,
        fingerprint: &Fingerprint,
        payload: &serde_json::Value,
    ) -> Result<(ReceiveTask, bool)> {
        let fresh = ReceiveTask::new(fingerprint.clone(), payload.clone());

        // The unique index on fingerprint decides the winner; losers fall
        // through to the fetch and see the winner's row.
        let inserted: Option<TaskRow> = sqlx::query_as(&format!(
            "INSERT INTO receive_tasks (id, fingerprint, state, payload, attempt_count, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, $5, $5)
             ON CONFLICT (fingerprint) DO NOTHING
             RETURNING {COLUMNS}"
        ))
        .bind(fresh.id.0)
        .bind(fingerprint.as_str())
        .bind(State::Received.as_str())
        .bind(payload)
        .bind(fresh.created_at)
        .fetch_optional(self.pool())
        .await?;

        if let Some(row) = inserted {
            return Ok((row.try_into_task()?, true));
        }

        let existing = self.get_by_fingerprint(fingerprint).await?;
        Ok((existing, false))
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: State,
        next: State,
        update: TransitionUpdate,
    ) -> Result<bool> {
        validate_transition(expected, next)?;

        let rows_affected = sqlx::query(
            "UPDATE receive_tasks
             SET state = $1, updated_at = $2, attempt_count = attempt_count + $3,
                 last_error = COALESCE($4, last_error)
             WHERE id = $5 AND state = $6",
        )
        .bind(next.as_str())
        .bind(Utc::now())
        .bind(i32::from(update.begin_attempt))
        .bind(update.last_error.as_deref())
        .bind(id.0)
        .bind(expected.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn touch(&self, id: TaskId, state: State) -> Result<bool> {
        let rows_affected =
            sqlx::query("UPDATE receive_tasks SET updated_at = $1 WHERE id = $2 AND state = $3")
                .bind(Utc::now())
                .bind(id.0)
                .bind(state.as_str())
                .execute(self.pool())
                .await?
                .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn get(&self, id: TaskId) -> Result<ReceiveTask> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM receive_tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<ReceiveTask> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM receive_tasks WHERE fingerprint = $1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("fingerprint {fingerprint}")))?
            .try_into_task()
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<ReceiveTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM receive_tasks
             WHERE ($1::text IS NULL OR state = $1)
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(filter.state.map(State::as_str))
        .bind(filter.limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn stale(
        &self,
        state: State,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReceiveTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM receive_tasks
             WHERE state = $1 AND updated_at < $2
             ORDER BY updated_at ASC
             LIMIT $3"
        ))
        .bind(state.as_str())
        .bind(updated_before)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn purge_terminal(&self, updated_before: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query(
            "DELETE FROM receive_tasks WHERE state IN ($1, $2) AND updated_at < $3",
        )
        .bind(State::Completed.as_str())
        .bind(State::Failed.as_str())
        .bind(updated_before)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(purged)
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    fingerprint: String,
    state: String,
    payload: serde_json::Value,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<ReceiveTask> {
        Ok(ReceiveTask {
            id: TaskId(self.id),
            fingerprint: Fingerprint::from_stored(self.fingerprint),
            state: self.state.parse()?,
            payload: self.payload,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
