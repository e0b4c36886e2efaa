//! Metric instrument factories for workfeed.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workfeed"` meter.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for workfeed instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workfeed")
}

/// Counter: broker-level operations (get, publish, ack, nack, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workfeed.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: refill attempts.
/// Labels: `trigger` ("start" | "idle" | "completion"), `result` ("task" | "empty" | "error").
pub fn feed_refills() -> Counter<u64> {
    meter()
        .u64_counter("workfeed.feed.refills")
        .with_description("Number of refill attempts")
        .build()
}

/// Counter: messages settled by the feed.
/// Labels: `queue`, `action` ("ack" | "reject" | "requeue").
pub fn feed_settlements() -> Counter<u64> {
    meter()
        .u64_counter("workfeed.feed.settlements")
        .with_description("Number of messages acknowledged or rejected")
        .build()
}

/// Counter: tasks finished by the local engine.
/// Labels: `result` ("success" | "failure").
pub fn engine_tasks() -> Counter<u64> {
    meter()
        .u64_counter("workfeed.engine.tasks")
        .with_description("Number of tasks finished by the engine")
        .build()
}
