//! Drain span helpers.
//!
//! Every worker activation runs inside one `gather.drain` span.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one worker activation.
///
/// `gather.items` and `gather.batches` are declared empty and filled by
/// [`record_drain_totals`] when the worker goes idle.
pub fn start_drain_span(gatherer: &str, worker_id: &Uuid) -> Span {
    tracing::info_span!(
        "gather.drain",
        "gather.name" = gatherer,
        "gather.worker_id" = %worker_id,
        "gather.items" = tracing::field::Empty,
        "gather.batches" = tracing::field::Empty,
    )
}

/// Emit a `debug` event for a finished batch, scoped to the given span.
pub fn record_batch(span: &Span, size: usize) {
    span.in_scope(|| {
        tracing::debug!(size, "batch drained");
    });
}

/// Record how much one activation drained before going idle.
pub fn record_drain_totals(span: &Span, items: u64, batches: u64) {
    span.record("gather.items", items);
    span.record("gather.batches", batches);
}
