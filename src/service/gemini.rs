//! Gemini `generateContent` backend.
//!
//! Sends image payloads as inline base64 data and text payloads as a plain
//! user part. The response shape is classified once, here, into a
//! [`ServiceOutput`] so nothing downstream inspects raw JSON.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{Instrument, debug};

use super::{DEFAULT_OCR_PROMPT, RecognitionRequest, RecognitionService};
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::Result;
use crate::model::{Payload, Recognition, ServiceOutput};
use crate::telemetry::{genai, metrics};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Gemini API client.
pub struct GeminiService {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl GeminiService {
    /// Create a client with a five minute request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_key: &SecretString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            api_key: SecretString::from(api_key.expose_secret().to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point at a different API root (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn build_request(&self, request: &RecognitionRequest) -> Result<GenerateRequest> {
        let parts = match request.payload {
            Payload::ImageFile {
                ref path,
                ref media_type,
            } => {
                let bytes = tokio::fs::read(path).await?;
                vec![
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: media_type.clone(),
                            data: BASE64.encode(bytes),
                        },
                    },
                    RequestPart::Text {
                        text: DEFAULT_OCR_PROMPT.to_string(),
                    },
                ]
            }
            Payload::Text { ref body, .. } => vec![RequestPart::Text { text: body.clone() }],
        };

        Ok(GenerateRequest {
            system_instruction: request.instructions.as_ref().map(|text| SystemInstruction {
                parts: vec![RequestPart::Text { text: text.clone() }],
            }),
            contents: vec![RequestContent {
                role: "user".to_string(),
                parts,
            }],
            generation_config: GenerationConfig {
                thinking_config: ThinkingConfig {
                    include_thoughts: true,
                },
            },
        })
    }

    async fn call(&self, request: &RecognitionRequest) -> Result<Recognition> {
        let body = self.build_request(request).await?;
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        debug!(model = %request.model, payload = %request.payload.label(), "calling gemini");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let parsed: GenerateResponse = response.json().await?;

        if let Some(ref usage) = parsed.usage_metadata {
            let input = usage.prompt_token_count.unwrap_or(0);
            let output = usage.candidates_token_count.unwrap_or(0)
                + usage.thoughts_token_count.unwrap_or(0);
            genai::record_token_usage(&tracing::Span::current(), input, output);
            let tokens = metrics::llm_tokens();
            for (direction, count) in [("input", input), ("output", output)] {
                tokens.add(
                    count,
                    &[
                        KeyValue::new("model", request.model.clone()),
                        KeyValue::new("provider", "gemini"),
                        KeyValue::new("direction", direction),
                    ],
                );
            }
        }

        if !status.is_success() && parsed.error.is_none() {
            return Ok(Recognition::error(format!("gemini returned HTTP {status}")));
        }
        Ok(classify(parsed))
    }
}

#[async_trait]
impl RecognitionService for GeminiService {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition> {
        let span = genai::start_chat_span(&request.model, "gemini");
        self.call(&request).instrument(span).await
    }
}

/// Decide the output shape of a response.
///
/// API errors and blocked prompts become `Error`; an inline image part wins
/// over text; otherwise non-thought text is joined, and thought parts form
/// the thinking trace.
pub(crate) fn classify(response: GenerateResponse) -> Recognition {
    if let Some(err) = response.error {
        return Recognition::error(err.message);
    }
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Recognition::error(format!("prompt blocked: {reason}"));
    }

    let parts: Vec<ResponsePart> = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    let mut text = String::new();
    let mut thinking = String::new();
    let mut image = None;

    for part in parts {
        if let Some(data) = part.inline_data {
            if image.is_none() && data.mime_type.starts_with("image/") {
                image = Some(data.data);
            }
            continue;
        }
        if let Some(t) = part.text {
            if part.thought {
                thinking.push_str(&t);
            } else {
                text.push_str(&t);
            }
        }
    }

    let thinking = (!thinking.is_empty()).then_some(thinking);

    let output = match image {
        Some(encoded) => match BASE64.decode(encoded.as_bytes()) {
            Ok(bytes) => ServiceOutput::Image(bytes),
            Err(e) => ServiceOutput::Error(format!("bad inline image data: {e}")),
        },
        None if text.trim().is_empty() => ServiceOutput::Empty,
        None => ServiceOutput::Text(text),
    };

    Recognition { output, thinking }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<RequestContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    role: String,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    thinking_config: ThinkingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    include_thoughts: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    thoughts_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> GenerateResponse {
        serde_json::from_value(value).expect("valid response fixture")
    }

    #[test]
    fn text_parts_are_joined_and_thoughts_split_out() {
        let r = classify(parse(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "looking at the header", "thought": true},
                        {"text": "Line one\n"},
                        {"text": "Line two"}
                    ]
                }
            }]
        })));
        assert_eq!(r.output, ServiceOutput::Text("Line one\nLine two".to_string()));
        assert_eq!(r.thinking.as_deref(), Some("looking at the header"));
    }

    #[test]
    fn api_error_is_an_error_output() {
        let r = classify(parse(json!({
            "error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}
        })));
        assert_eq!(
            r.output,
            ServiceOutput::Error("Resource has been exhausted".to_string())
        );
    }

    #[test]
    fn blocked_prompt_is_an_error_output() {
        let r = classify(parse(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        })));
        assert!(matches!(r.output, ServiceOutput::Error(ref m) if m.contains("SAFETY")));
    }

    #[test]
    fn inline_image_wins_over_text() {
        let r = classify(parse(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "here you go"},
                        {"inlineData": {"mimeType": "image/png", "data": BASE64.encode([1u8, 2, 3])}}
                    ]
                }
            }]
        })));
        assert_eq!(r.output, ServiceOutput::Image(vec![1, 2, 3]));
    }

    #[test]
    fn no_candidates_is_empty() {
        let r = classify(parse(json!({"candidates": []})));
        assert_eq!(r.output, ServiceOutput::Empty);
        assert!(r.thinking.is_none());
    }

    #[test]
    fn whitespace_only_text_is_empty() {
        let r = classify(parse(json!({
            "candidates": [{"content": {"parts": [{"text": "  \n"}]}}]
        })));
        assert_eq!(r.output, ServiceOutput::Empty);
    }
}
