//! Core data model.
//!
//! A receive task is the durable record of one accepted event. It has identity
//! (id + fingerprint), the immutable event payload, and lifecycle state.

pub mod descriptor;

pub use descriptor::EventDescriptor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::fingerprint::Fingerprint;

// ---------------------------------------------------------------------------
// Receive Task
// ---------------------------------------------------------------------------

/// One accepted event and its progress through the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveTask {
    pub id: TaskId,

    /// Idempotency key. At most one task exists per fingerprint.
    pub fingerprint: Fingerprint,

    pub state: State,

    /// The event descriptor as it was received. Never rewritten.
    pub payload: serde_json::Value,

    /// Number of times the task has entered `Processing`.
    pub attempt_count: u32,

    /// Failure detail from the most recent failed attempt.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReceiveTask {
    /// A fresh task in `Received`.
    pub fn new(fingerprint: Fingerprint, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            fingerprint,
            state: State::Received,
            payload,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Newtype for receive task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|_| Error::NotFound(format!("task {s}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a receive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Durably recorded, enqueue not yet confirmed.
    Received,
    /// Handed to the dispatch queue, waiting for a worker.
    Queued,
    /// A worker owns the current attempt.
    Processing,
    /// Processed successfully. Terminal.
    Completed,
    /// Attempts exhausted or non-retryable failure. Terminal.
    Failed,
}

impl State {
    pub const ALL: [State; 5] = [
        State::Received,
        State::Queued,
        State::Processing,
        State::Completed,
        State::Failed,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Received, Queued)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Queued) // retry
                | (Processing, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Received => "RECEIVED",
            State::Queued => "QUEUED",
            State::Processing => "PROCESSING",
            State::Completed => "COMPLETED",
            State::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Other(format!("unknown state: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_edges_are_allowed() {
        let allowed = [
            (State::Received, State::Queued),
            (State::Queued, State::Processing),
            (State::Processing, State::Completed),
            (State::Processing, State::Queued),
            (State::Processing, State::Failed),
        ];
        for from in State::ALL {
            for to in State::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in State::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(State::ALL.iter().all(|&to| !from.can_transition_to(to)));
        }
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("processing".parse::<State>().unwrap(), State::Processing);
        assert_eq!("FAILED".parse::<State>().unwrap(), State::Failed);
        assert!("dead".parse::<State>().is_err());
    }

    #[test]
    fn state_serializes_upper_case() {
        assert_eq!(
            serde_json::to_value(State::Received).unwrap(),
            serde_json::json!("RECEIVED")
        );
    }

    #[test]
    fn malformed_task_id_reads_as_not_found() {
        assert!(matches!(
            "not-a-uuid".parse::<TaskId>(),
            Err(Error::NotFound(_))
        ));
    }
}
