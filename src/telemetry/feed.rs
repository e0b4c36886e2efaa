//! Span helpers for refills and task execution.

use tracing::Span;

use crate::model::Task;

/// Start a span for one refill attempt.
///
/// The `feed.submitted` field is declared empty and filled by
/// [`record_refill`].
pub fn start_refill_span(trigger: &str, queue: &str) -> Span {
    tracing::debug_span!(
        "feed.refill",
        "feed.trigger" = trigger,
        "feed.queue" = queue,
        "feed.submitted" = tracing::field::Empty,
    )
}

/// Record how many tasks a refill submitted.
pub fn record_refill(span: &Span, submitted: usize) {
    span.record("feed.submitted", submitted as u64);
}

/// Start a span for executing one task.
pub fn start_task_span(task: &Task) -> Span {
    let ack = task.ack_context();
    tracing::info_span!(
        "task.execute",
        "task.id" = %task.id(),
        "task.target" = task.target(),
        "task.queue" = %ack.queue,
        "task.delivery_tag" = %ack.delivery_tag,
    )
}
