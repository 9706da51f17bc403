//! Structured events emitted by the dispatcher on every item transition.
//!
//! Consumers subscribe to render per-item badges, progress, and error
//! annotations. Completions arrive in whatever order the service returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::limits::Limits;
use crate::model::WorkId;

/// A structured event emitted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ItemQueued {
        id: WorkId,
    },
    ItemProcessing {
        id: WorkId,
        attempt: u32,
    },
    ItemCompleted {
        id: WorkId,
        duration_ms: u64,
    },
    ItemFailed {
        id: WorkId,
        error: String,
        duration_ms: u64,
    },
    ItemRetried {
        id: WorkId,
    },
    ItemRemoved {
        id: WorkId,
    },
    LimitsChanged {
        limits: Limits,
    },
}
