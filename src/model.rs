//! Core data model.
//!
//! A work item is one piece of uploaded content waiting for the external
//! OCR/translation service. It has identity, a payload, and a lifecycle state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkId,

    /// What to send to the service. Opaque to the dispatcher.
    pub payload: Payload,

    /// Current lifecycle state.
    pub state: State,

    /// When the item was first enqueued. Display and diagnostics only.
    pub enqueued_at: DateTime<Utc>,

    /// Number of times the item has been admitted to the service.
    pub attempts: u32,

    /// Result of the most recent attempt, once settled.
    pub outcome: Option<Outcome>,

    /// FIFO position. Re-assigned when a failed item is retried.
    #[serde(skip)]
    pub(crate) seq: u64,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItem {
    /// File name for this item's output, unique per item.
    ///
    /// `scan.png` with id `1a2b3c4d` and extension `txt` gives
    /// `scan-1a2b3c4d.txt`.
    pub fn output_file_name(&self, ext: &str) -> String {
        let label = self.payload.label();
        let stem = Path::new(&label)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("output");
        format!("{stem}-{}.{ext}", self.id)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for an admission slot.
    Queued,
    /// Admitted; the service call is in flight.
    Processing,
    /// The service returned without error.
    Completed,
    /// The service returned an error or the call raised one.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Queued) // manual retry
        )
    }

    /// Has the item finished its current attempt?
    pub fn is_settled(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Queued => "queued",
            State::Processing => "processing",
            State::Completed => "completed",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(State::Queued),
            "processing" => Ok(State::Processing),
            "completed" => Ok(State::Completed),
            "failed" => Ok(State::Failed),
            other => Err(Error::Other(format!("unknown state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What a work item asks the service to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// An image on disk to OCR.
    ImageFile { path: PathBuf, media_type: String },
    /// Text or HTML content to translate.
    Text { name: String, body: String },
}

impl Payload {
    /// Classify a file by extension and build the matching payload.
    ///
    /// Text files are read eagerly; images are read by the service at call time.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if let Some(media_type) = image_media_type(&ext) {
            return Ok(Payload::ImageFile {
                path: path.to_path_buf(),
                media_type: media_type.to_string(),
            });
        }

        match ext.as_str() {
            "txt" | "md" | "html" | "htm" => {
                let body = tokio::fs::read_to_string(path).await?;
                Ok(Payload::Text {
                    name: path.display().to_string(),
                    body,
                })
            }
            _ => Err(Error::Config(format!(
                "unsupported file type: {}",
                path.display()
            ))),
        }
    }

    /// Human-readable name for listings.
    pub fn label(&self) -> String {
        match self {
            Payload::ImageFile { path, .. } => path.display().to_string(),
            Payload::Text { name, .. } => name.clone(),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Payload::ImageFile { .. })
    }
}

fn image_media_type(ext: &str) -> Option<&'static str> {
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Service output
// ---------------------------------------------------------------------------

/// Shape of a service response, decided once at the service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ServiceOutput {
    Text(String),
    Image(Vec<u8>),
    Empty,
    Error(String),
}

/// What the external service hands back for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recognition {
    pub output: ServiceOutput,
    /// Model reasoning trace, when the provider exposes one.
    pub thinking: Option<String>,
}

impl Recognition {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: ServiceOutput::Text(text.into()),
            thinking: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: ServiceOutput::Error(message.into()),
            thinking: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of an attempt, stored with the work item once it settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Service output for completed items. None on failure.
    pub output: Option<ServiceOutput>,
    pub thinking: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Wall time of the service call.
    pub duration_ms: u64,
}

impl Outcome {
    /// Extracted text, if the service produced any.
    pub fn text(&self) -> Option<&str> {
        match self.output {
            Some(ServiceOutput::Text(ref t)) => Some(t),
            _ => None,
        }
    }
}
