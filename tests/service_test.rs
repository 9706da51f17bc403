//! Live tests against the external services.
//!
//! Require `FOLIO_API_KEY` (and a `.env` is honored). Run with:
//! ```sh
//! cargo test --test service_test -- --ignored --nocapture
//! ```

use folio::config::secrets::SecretString;
use folio::model::{Payload, ServiceOutput};
use folio::service::{GeminiService, RecognitionRequest, RecognitionService, RequestOptions};

fn api_key() -> SecretString {
    dotenvy::dotenv().ok();
    SecretString::from(std::env::var("FOLIO_API_KEY").expect("FOLIO_API_KEY must be set"))
}

#[tokio::test]
#[ignore]
async fn gemini_translates_text() {
    let service = GeminiService::new(&api_key()).unwrap();
    let request = RecognitionRequest::new(
        Payload::Text {
            name: "greeting.txt".to_string(),
            body: "Guten Morgen".to_string(),
        },
        &RequestOptions {
            model: folio::service::gemini::DEFAULT_MODEL.to_string(),
            instructions: Some("Translate to English. Reply with the translation only.".into()),
        },
    );

    let result = service.recognize(request).await.unwrap();
    println!("{result:?}");
    match result.output {
        ServiceOutput::Text(text) => assert!(text.to_lowercase().contains("morning")),
        other => panic!("expected text, got {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn gemini_bad_model_is_an_error_output() {
    let service = GeminiService::new(&api_key()).unwrap();
    let request = RecognitionRequest::new(
        Payload::Text {
            name: "x.txt".to_string(),
            body: "hello".to_string(),
        },
        &RequestOptions {
            model: "no-such-model".to_string(),
            instructions: None,
        },
    );

    let result = service.recognize(request).await.unwrap();
    assert!(matches!(result.output, ServiceOutput::Error(_)));
}
