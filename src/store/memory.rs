//! In-process task store.
//!
//! Every operation runs inside one mutex critical section, which gives the
//! same atomicity the Postgres store gets from its unique index and
//! conditional `UPDATE`. Used by tests and single-process dev runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{TaskFilter, TaskStore, TransitionUpdate, validate_transition};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{ReceiveTask, State, TaskId};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, ReceiveTask>,
    by_fingerprint: HashMap<Fingerprint, TaskId>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
    fail_next: AtomicU32,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with [`Error::StoreUnavailable`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite `updated_at`, for exercising age-based sweeps.
    pub fn backdate(&self, id: TaskId, updated_at: DateTime<Utc>) {
        if let Some(task) = self.lock().tasks.get_mut(&id) {
            task.updated_at = updated_at;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(Error::StoreUnavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_or_fetch(
        &self,
        fingerprint: &Fingerprint,
        payload: &serde_json::Value,
    ) -> Result<(ReceiveTask, bool)> {
        self.check_available()?;
        let mut inner = self.lock();

        if let Some(id) = inner.by_fingerprint.get(fingerprint) {
            let existing = inner.tasks[id].clone();
            return Ok((existing, false));
        }

        let task = ReceiveTask::new(fingerprint.clone(), payload.clone());
        inner.by_fingerprint.insert(fingerprint.clone(), task.id);
        inner.tasks.insert(task.id, task.clone());
        Ok((task, true))
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: State,
        next: State,
        update: TransitionUpdate,
    ) -> Result<bool> {
        validate_transition(expected, next)?;
        self.check_available()?;
        let mut inner = self.lock();

        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.state != expected {
            return Ok(false);
        }

        task.state = next;
        task.updated_at = Utc::now();
        if update.begin_attempt {
            task.attempt_count += 1;
        }
        if let Some(error) = update.last_error {
            task.last_error = Some(error);
        }
        Ok(true)
    }

    async fn touch(&self, id: TaskId, state: State) -> Result<bool> {
        self.check_available()?;
        match self.lock().tasks.get_mut(&id) {
            Some(task) if task.state == state => {
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: TaskId) -> Result<ReceiveTask> {
        self.check_available()?;
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<ReceiveTask> {
        self.check_available()?;
        let inner = self.lock();
        inner
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| inner.tasks.get(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("fingerprint {fingerprint}")))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<ReceiveTask>> {
        self.check_available()?;
        let mut tasks: Vec<ReceiveTask> = self
            .lock()
            .tasks
            .values()
            .filter(|t| filter.state.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(usize::try_from(filter.limit).unwrap_or(0));
        Ok(tasks)
    }

    async fn stale(
        &self,
        state: State,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReceiveTask>> {
        self.check_available()?;
        let mut tasks: Vec<ReceiveTask> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.state == state && t.updated_at < updated_before)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        tasks.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(tasks)
    }

    async fn purge_terminal(&self, updated_before: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.lock();
        let doomed: Vec<(TaskId, Fingerprint)> = inner
            .tasks
            .values()
            .filter(|t| t.state.is_terminal() && t.updated_at < updated_before)
            .map(|t| (t.id, t.fingerprint.clone()))
            .collect();
        for (id, fingerprint) in &doomed {
            inner.tasks.remove(id);
            inner.by_fingerprint.remove(fingerprint);
        }
        Ok(doomed.len() as u64)
    }

    async fn health_check(&self) -> Result<()> {
        self.check_available()
    }
}
