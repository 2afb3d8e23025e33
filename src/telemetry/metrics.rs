//! Metric instrument factories for verifyq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"verifyq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for verifyq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("verifyq")
}

/// Counter: items moved into a result set.
/// Labels: `verdict` ("positive" | "negative").
pub fn items_committed() -> Counter<u64> {
    meter()
        .u64_counter("verifyq.items.committed")
        .with_description("Number of items committed to a result set")
        .build()
}

/// Counter: items handed back after an inconclusive verification.
/// Labels: `cause` (the outcome that triggered the requeue).
pub fn items_requeued() -> Counter<u64> {
    meter()
        .u64_counter("verifyq.items.requeued")
        .with_description("Number of items requeued for another attempt")
        .build()
}

/// Counter: tokens removed from the pool.
/// Labels: `reason` ("exhausted" | "invalid").
pub fn tokens_retired() -> Counter<u64> {
    meter()
        .u64_counter("verifyq.tokens.retired")
        .with_description("Number of capability tokens retired")
        .build()
}

/// Counter: classified verification outcomes.
/// Labels: `outcome`.
pub fn verify_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("verifyq.verify.outcomes")
        .with_description("Number of verification attempts by outcome")
        .build()
}

/// Histogram: pause between batches in milliseconds.
pub fn batch_delay_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("verifyq.batch.delay_ms")
        .with_description("Adaptive delay between batches")
        .with_unit("ms")
        .build()
}
