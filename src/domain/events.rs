//! Events published while importing, exporting and deleting content.
//!
//! Observers subscribe through the orchestrator's event bus; every event is
//! tagged with the operation that produced it so concurrent imports can be
//! told apart.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single content event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// The import/export/delete invocation this event belongs to
    pub operation_id: Uuid,

    /// What happened
    pub kind: ContentEventKind,
}

impl ContentEvent {
    pub fn new(operation_id: Uuid, kind: ContentEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation_id,
            kind,
        }
    }
}

/// Types of content events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentEventKind {
    /// `current` of `total` manifest items processed
    ImportProgress { current: usize, total: usize },

    /// Import finished and all records were committed
    ImportCompleted {
        root_identifier: Option<String>,
        imported: usize,
        skipped: usize,
    },

    /// Import stopped at a pipeline stage
    ImportFailed { stage: String, error: String },

    /// Export archive was written
    ExportCompleted {
        archive_path: PathBuf,
        content_count: usize,
    },

    /// A content record was removed or released
    ContentDeleted { identifier: String },
}
