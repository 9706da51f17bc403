//! Metric instrument factories for folio.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"folio"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for folio instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("folio")
}

/// Counter: work items admitted to the external service.
/// Labels: `payload` ("image" | "text").
pub fn dispatch_admissions() -> Counter<u64> {
    meter()
        .u64_counter("folio.dispatch.admissions")
        .with_description("Number of work items admitted to the service")
        .build()
}

/// Counter: dispatch passes that left queued work waiting.
/// Labels: `reason` ("rate_window" | "concurrency" | "disabled").
pub fn dispatch_deferred() -> Counter<u64> {
    meter()
        .u64_counter("folio.dispatch.deferred")
        .with_description("Dispatch passes that deferred queued work")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("folio.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Histogram: external service call duration in milliseconds.
/// Labels: `result` ("completed" | "failed").
pub fn service_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("folio.service.duration_ms")
        .with_description("External service call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: LLM token usage.
/// Labels: `model`, `provider`, `direction` ("input" | "output").
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("folio.llm.tokens")
        .with_description("LLM token usage")
        .build()
}
