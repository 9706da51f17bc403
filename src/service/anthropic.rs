//! Anthropic backend via rig-core.
//!
//! Text payloads are sent as a single prompt to a rig agent whose preamble
//! carries the caller's instructions. Image payloads are refused; route
//! those through the Gemini backend.
//!
//! # Example
//! ```no_run
//! use folio::config::secrets::SecretString;
//! use folio::service::anthropic::AnthropicService;
//!
//! let key = SecretString::from("sk-ant-...");
//! let service = AnthropicService::new(&key).expect("failed to create Anthropic client");
//! ```

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use tracing::{Instrument, debug};

use super::{RecognitionRequest, RecognitionService};
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};
use crate::model::{Payload, Recognition, ServiceOutput};
use crate::telemetry::genai;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const MAX_TOKENS: u64 = 8192;

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> std::result::Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

pub struct AnthropicService {
    client: rig::providers::anthropic::Client,
}

impl AnthropicService {
    /// # Errors
    /// Returns a configuration error if the client cannot be built.
    pub fn new(api_key: &SecretString) -> Result<Self> {
        let client = anthropic_client(api_key)
            .map_err(|e| Error::Config(format!("failed to create Anthropic client: {e}")))?;
        Ok(Self { client })
    }

    async fn call(&self, request: &RecognitionRequest) -> Result<Recognition> {
        let body = match request.payload {
            Payload::Text { ref body, .. } => body,
            Payload::ImageFile { ref path, .. } => {
                return Err(Error::Service(format!(
                    "anthropic backend does not accept images: {}",
                    path.display()
                )));
            }
        };

        let mut builder = self.client.agent(&request.model).max_tokens(MAX_TOKENS);
        if let Some(ref instructions) = request.instructions {
            builder = builder.preamble(instructions);
        }
        let agent = builder.build();

        debug!(model = %request.model, payload = %request.payload.label(), "calling anthropic");
        let text = agent
            .prompt(body.as_str())
            .await
            .map_err(|e| Error::Service(e.to_string()))?;

        let output = if text.trim().is_empty() {
            ServiceOutput::Empty
        } else {
            ServiceOutput::Text(text)
        };
        Ok(Recognition {
            output,
            thinking: None,
        })
    }
}

#[async_trait]
impl RecognitionService for AnthropicService {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition> {
        let span = genai::start_chat_span(&request.model, "anthropic");
        self.call(&request).instrument(span).await
    }
}
