//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Instruments are no-ops until a provider is installed by
//! [`init_telemetry`](super::init_telemetry).

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("fifo-gatherer")
}

/// Counter: items handed to `enqueue`.
/// Labels: `gatherer`.
pub fn items_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("gather.items.enqueued")
        .with_description("Number of items enqueued")
        .build()
}

/// Counter: items whose callback ran, successfully or not.
/// Labels: `gatherer`.
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("gather.items.processed")
        .with_description("Number of items passed to the callback")
        .build()
}

/// Counter: callbacks that returned an error or panicked.
/// Labels: `gatherer`, `kind` ("failed" | "panicked").
pub fn callback_failures() -> Counter<u64> {
    meter()
        .u64_counter("gather.callback.failures")
        .with_description("Number of failed item callbacks")
        .build()
}

/// Counter: worker activations started.
/// Labels: `gatherer`, `mode` ("thread" | "tokio" | "inline").
pub fn workers_spawned() -> Counter<u64> {
    meter()
        .u64_counter("gather.workers.spawned")
        .with_description("Number of drain worker activations")
        .build()
}

/// Histogram: items drained per batch.
/// Labels: `gatherer`.
pub fn drain_batch_size() -> Histogram<u64> {
    meter()
        .u64_histogram("gather.drain.batch_size")
        .with_description("Items drained per batch")
        .build()
}
