//! Receiver, status, and health handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::json;

use super::{ApiError, AppState, TaskHandle, TaskStatus};
use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::model::TaskId;

/// `POST /tasks`: 201 for a new task, 200 when the fingerprint is already known.
pub async fn receive_task(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskHandle>), ApiError> {
    let Json(body) = body.map_err(|e| Error::Validation(e.body_text()))?;
    let receipt = state.receiver.receive(body).await?;

    let status = if receipt.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(TaskHandle {
            id: receipt.task.id,
            state: receipt.task.state,
        }),
    ))
}

/// `GET /tasks/{id}`. Ids that are not UUIDs cannot exist and read as 404.
pub async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatus>, ApiError> {
    let id: TaskId = id.parse()?;
    let task = state.receiver.status(id).await?;
    Ok(Json(task.into()))
}

/// `GET /tasks/by-fingerprint/{fingerprint}`.
pub async fn task_status_by_fingerprint(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<TaskStatus>, ApiError> {
    let fingerprint = Fingerprint::parse(&fingerprint)?;
    let task = state.receiver.status_by_fingerprint(&fingerprint).await?;
    Ok(Json(task.into()))
}

/// `GET /health`: 200 when the task store answers, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.receiver.health().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}
