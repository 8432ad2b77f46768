//! HTTP boundary: the receiver and status endpoints.
//!
//! - `POST /tasks`: submit an event descriptor.
//! - `GET /tasks/{id}`: task status by id.
//! - `GET /tasks/by-fingerprint/{fingerprint}`: task status by fingerprint.
//! - `GET /health`: 200 when the task store answers.

pub mod error;
pub mod handlers;

pub use error::ApiError;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::fingerprint::Fingerprint;
use crate::model::{ReceiveTask, State, TaskId};
use crate::receiver::Receiver;

/// Shared handler state. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<Receiver>,
}

impl AppState {
    pub fn new(receiver: Receiver) -> Self {
        Self {
            receiver: Arc::new(receiver),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(handlers::receive_task))
        .route("/tasks/{id}", get(handlers::task_status))
        .route(
            "/tasks/by-fingerprint/{fingerprint}",
            get(handlers::task_status_by_fingerprint),
        )
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body of `POST /tasks` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub state: State,
}

/// Body of status responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub fingerprint: Fingerprint,
    pub state: State,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ReceiveTask> for TaskStatus {
    fn from(task: ReceiveTask) -> Self {
        Self {
            id: task.id,
            fingerprint: task.fingerprint,
            state: task.state,
            attempt_count: task.attempt_count,
            last_error: task.last_error,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}
