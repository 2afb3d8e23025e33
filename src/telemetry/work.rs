//! Span helpers for batches and individual verifications.

use tracing::Span;
use uuid::Uuid;

use crate::model::{Outcome, WorkItem};

/// Start a span for one scheduler batch.
pub fn start_batch_span(run_id: &Uuid, batch: u64) -> Span {
    tracing::info_span!(
        "verify.batch",
        "verify.run_id" = %run_id,
        "verify.batch" = batch,
    )
}

/// Start a span for one verification call.
///
/// The `verify.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_check_span(item: &WorkItem) -> Span {
    tracing::info_span!(
        "verify.check",
        "verify.item" = %item,
        "verify.outcome" = tracing::field::Empty,
    )
}

/// Record the classified outcome on a check span.
pub fn record_outcome(span: &Span, outcome: Outcome) {
    span.record("verify.outcome", outcome.as_str());
}
