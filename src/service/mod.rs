//! External OCR/translation service boundary.
//!
//! The dispatcher only knows [`RecognitionService`]: an async call that takes
//! a payload and returns a [`Recognition`] or an error. Credentials live in
//! the implementation. Latency and timeouts are the implementation's concern.

pub mod anthropic;
pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Payload, Recognition};

pub use anthropic::AnthropicService;
pub use gemini::GeminiService;

/// Default instruction for image payloads when the caller gives none.
pub const DEFAULT_OCR_PROMPT: &str =
    "Extract all text visible in this image. Preserve line breaks and reading order. \
     Respond with the text only.";

/// Per-dispatcher settings attached to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOptions {
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// One call to the external service.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub payload: Payload,
    pub model: String,
    pub instructions: Option<String>,
}

impl RecognitionRequest {
    pub fn new(payload: Payload, options: &RequestOptions) -> Self {
        Self {
            payload,
            model: options.model.clone(),
            instructions: options.instructions.clone(),
        }
    }
}

/// The external OCR/translation collaborator.
///
/// Returning `Err` and returning a `ServiceOutput::Error` are equivalent to
/// the dispatcher: both fail the item.
#[async_trait]
pub trait RecognitionService: Send + Sync + 'static {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition>;
}

#[async_trait]
impl<S: RecognitionService + ?Sized> RecognitionService for Arc<S> {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition> {
        (**self).recognize(request).await
    }
}

#[async_trait]
impl<S: RecognitionService + ?Sized> RecognitionService for Box<S> {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition> {
        (**self).recognize(request).await
    }
}
