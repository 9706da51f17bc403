//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the dispatcher.

use tracing::Span;

use crate::model::WorkId;

/// Start a span covering one admission of a work item.
pub fn start_work_span(payload_kind: &str, work_id: WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.payload" = payload_kind,
        "work.id" = %work_id.0,
        "work.attempt" = attempt,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
