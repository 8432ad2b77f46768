//! Metric instrument factories for proxymod-dispatcher.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"proxymod-dispatcher"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for proxymod-dispatcher instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("proxymod-dispatcher")
}

/// Counter: events accepted by the receiver.
/// Labels: `result` ("created" | "duplicate" | "invalid").
pub fn tasks_received() -> Counter<u64> {
    meter()
        .u64_counter("proxymod.tasks.received")
        .with_description("Number of events accepted by the receiver")
        .build()
}

/// Counter: receive task state transitions won by this process.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("proxymod.tasks.state_transitions")
        .with_description("Number of receive task state transitions")
        .build()
}

/// Counter: dispatch queue operations (enqueue, send, read, archive).
/// Labels: `operation`, plus `queue` or `result`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("proxymod.queue.operations")
        .with_description("Number of dispatch queue operations")
        .build()
}

/// Counter: deliveries acked without processing because the task had moved on.
pub fn duplicate_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("proxymod.queue.duplicate_deliveries")
        .with_description("Deliveries absorbed as duplicates")
        .build()
}

/// Counter: tasks recovered by the sweeper.
/// Labels: `reason` ("orphaned" | "lease_expired" | "requeued").
pub fn tasks_swept() -> Counter<u64> {
    meter()
        .u64_counter("proxymod.tasks.swept")
        .with_description("Receive tasks recovered by the sweeper")
        .build()
}

/// Histogram: processing attempt duration in milliseconds.
/// Labels: `outcome` ("ok" | "error" | "timeout").
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("proxymod.processing.duration_ms")
        .with_description("Processing attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}
