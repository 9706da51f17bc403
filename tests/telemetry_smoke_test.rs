//! Smoke tests for the full observability stack.
//!
//! These tests need an OTLP collector on :4317 feeding Tempo (:3200),
//! Prometheus (:9090), and Loki (:3100).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use folio::model::WorkId;
use opentelemetry::KeyValue;

static TELEMETRY: OnceLock<folio::telemetry::TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static folio::telemetry::TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        folio::telemetry::init_telemetry(folio::telemetry::TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            ..folio::telemetry::TelemetryConfig::new("folio-smoke-test")
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &folio::telemetry::TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

#[test]
#[ignore]
fn smoke_dispatch_lifecycle() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        let work_id = WorkId::new();

        // Spans must be entered to be exported.
        {
            let work_span = folio::telemetry::work::start_work_span("image", work_id, 1);
            let _work_enter = work_span.enter();
            folio::telemetry::work::record_state_transition(&work_span, "queued", "processing");
            {
                let chat = folio::telemetry::genai::start_chat_span("gemini-2.5-flash", "gemini");
                let _chat_enter = chat.enter();
                folio::telemetry::genai::record_token_usage(&chat, 1200, 300);
            }
            folio::telemetry::work::record_state_transition(&work_span, "processing", "completed");
        }

        folio::telemetry::metrics::dispatch_admissions()
            .add(1, &[KeyValue::new("payload", "image")]);
        folio::telemetry::metrics::dispatch_deferred()
            .add(1, &[KeyValue::new("reason", "rate_window")]);
        folio::telemetry::metrics::service_duration_ms()
            .record(850.0, &[KeyValue::new("result", "completed")]);

        tracing::info!(id = %work_id, "work item admitted");
        tracing::warn!(id = %work_id, "simulated failure during smoke test");

        flush_and_wait(guard).await;

        let client = reqwest::Client::new();

        // Tempo
        let resp = client
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=folio-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        let body: serde_json::Value = resp.json().await.unwrap();
        let trace_count = body["traces"].as_array().map_or(0, |t| t.len());
        println!("Tempo: {trace_count} trace(s)");
        assert!(trace_count > 0, "expected traces in Tempo");

        // Prometheus
        let resp = client
            .get("http://localhost:9090/api/v1/query")
            .query(&[("query", "folio_dispatch_admissions_total")])
            .send()
            .await
            .expect("failed to query Prometheus");
        let body: serde_json::Value = resp.json().await.unwrap();
        let metric_count = body["data"]["result"].as_array().map_or(0, |r| r.len());
        println!("Prometheus: {metric_count} series");
        assert!(metric_count > 0, "expected metrics in Prometheus");

        // Loki
        let resp = client
            .get("http://localhost:3100/loki/api/v1/query_range")
            .query(&[
                ("query", r#"{service_name="folio-smoke-test"}"#),
                ("limit", "10"),
            ])
            .send()
            .await
            .expect("failed to query Loki");
        let body: serde_json::Value = resp.json().await.unwrap();
        let log_count = body["data"]["result"].as_array().map_or(0, |s| s.len());
        println!("Loki: {log_count} stream(s)");
        assert!(log_count > 0, "expected logs in Loki");
    });
}
