//! Task processing span helpers.

use tracing::Span;

use crate::model::{State, TaskId};
use crate::telemetry::metrics;

/// Start a span covering one delivery of a task.
///
/// The `task.state` field is declared empty and updated via
/// [`record_state_transition`].
pub fn start_task_span(task_id: TaskId, read_count: u32) -> Span {
    tracing::info_span!(
        "task.process",
        "task.id" = %task_id,
        "delivery.read_count" = read_count,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a won transition: emit an event on the span and count it.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("task.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
    metrics::state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.as_str()),
            opentelemetry::KeyValue::new("to", to.as_str()),
        ],
    );
}
