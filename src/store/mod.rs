//! Task store: durable receive-task rows with atomic create-or-fetch and
//! conditional state transitions.
//!
//! Correctness of the whole pipeline across receiver and worker instances
//! rests on two primitives here: the fingerprint uniqueness behind
//! [`TaskStore::create_or_fetch`], and the compare-and-set behind
//! [`TaskStore::transition`]. No caller holds a lock across either.

pub mod memory;

pub use memory::MemoryTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{ReceiveTask, State, TaskId};

/// Field changes applied together with a successful transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionUpdate {
    /// Replaces `last_error` when set; `None` leaves it unchanged.
    pub last_error: Option<String>,
    /// Bump `attempt_count` by one.
    pub begin_attempt: bool,
}

impl TransitionUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    /// Entering `Processing` for a new attempt.
    pub fn begin_attempt() -> Self {
        Self {
            last_error: None,
            begin_attempt: true,
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            begin_attempt: false,
        }
    }
}

/// Listing filter for operator queries.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub state: Option<State>,
    pub limit: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            state: None,
            limit: 20,
        }
    }
}

/// Persistence for receive tasks. One implementation per backing technology.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `Received` task for `fingerprint` unless one exists.
    ///
    /// Returns the task and whether this call created it. Concurrent callers
    /// on the same fingerprint all observe the same task; exactly one sees
    /// `true`.
    async fn create_or_fetch(
        &self,
        fingerprint: &Fingerprint,
        payload: &serde_json::Value,
    ) -> Result<(ReceiveTask, bool)>;

    /// Move `id` from `expected` to `next` if it is still in `expected`.
    ///
    /// `Ok(false)` means another writer got there first (or the task is
    /// gone). Edges outside the state machine are rejected with
    /// [`Error::InvalidTransition`] before touching the row.
    async fn transition(
        &self,
        id: TaskId,
        expected: State,
        next: State,
        update: TransitionUpdate,
    ) -> Result<bool>;

    async fn get(&self, id: TaskId) -> Result<ReceiveTask>;

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<ReceiveTask>;

    /// Newest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<ReceiveTask>>;

    /// Bump `updated_at` if the task is still in `state`. `Ok(false)` otherwise.
    async fn touch(&self, id: TaskId, state: State) -> Result<bool>;

    /// Tasks that have been in `state` since before `updated_before`, oldest first.
    async fn stale(
        &self,
        state: State,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReceiveTask>>;

    /// Delete terminal tasks last updated before the cutoff. Operator retention only.
    async fn purge_terminal(&self, updated_before: DateTime<Utc>) -> Result<u64>;

    async fn health_check(&self) -> Result<()>;
}

/// Validate a state transition, returning an error if disallowed.
pub fn validate_transition(from: State, to: State) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}
