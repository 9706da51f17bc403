//! Integration tests for telemetry initialization and span helpers.

use folio::model::WorkId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A subscriber can only be set once per process; try_init() inside
    // init_telemetry returns Err instead of panicking if one exists.
    let config = folio::telemetry::TelemetryConfig::new("folio-test");
    if let Ok(guard) = folio::telemetry::init_telemetry(config) {
        // No OTLP pipelines, so flushing and dropping are no-ops.
        guard.force_flush();
        tracing::info!(component = "telemetry-test", "logged to stderr only");
    }
}

#[test]
fn genai_chat_span_creates_and_records_tokens() {
    let span = folio::telemetry::genai::start_chat_span("gemini-2.5-flash", "gemini");
    folio::telemetry::genai::record_token_usage(&span, 100, 50);
}

#[test]
fn work_span_creates_and_records_transition() {
    let span = folio::telemetry::work::start_work_span("text", WorkId::new(), 1);
    folio::telemetry::work::record_state_transition(&span, "queued", "processing");
}

#[test]
fn metric_instruments_work_without_a_provider() {
    use opentelemetry::KeyValue;

    folio::telemetry::metrics::dispatch_deferred()
        .add(1, &[KeyValue::new("reason", "concurrency")]);
    folio::telemetry::metrics::service_duration_ms()
        .record(12.0, &[KeyValue::new("result", "failed")]);
}
