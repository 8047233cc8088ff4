//! Persisted content records.
//!
//! A `ContentRecord` is the unit of content tracked in the record store. It is
//! created on the first successful import of an identifier and merged on every
//! later import that references it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mime type of collections (textbooks, courses, units)
pub const COLLECTION_MIME_TYPE: &str = "application/vnd.ekstep.content-collection";

/// Availability of a content's artifact on this device.
///
/// Ordered: a record may move from `OnlySpine` to `ArtifactAvailable`
/// but never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentState {
    /// Metadata is known, the artifact is not on disk
    OnlySpine,

    /// The artifact has been materialized locally
    ArtifactAvailable,
}

impl ContentState {
    /// Column value stored in the `content_state` column
    pub fn as_i64(self) -> i64 {
        match self {
            ContentState::OnlySpine => 1,
            ContentState::ArtifactAvailable => 2,
        }
    }

    /// Parse the `content_state` column value
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ContentState::OnlySpine),
            2 => Some(ContentState::ArtifactAvailable),
            _ => None,
        }
    }

    /// Merge two states, keeping the more available one
    pub fn merge(self, other: ContentState) -> ContentState {
        self.max(other)
    }
}

impl std::fmt::Display for ContentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentState::OnlySpine => write!(f, "only_spine"),
            ContentState::ArtifactAvailable => write!(f, "artifact_available"),
        }
    }
}

/// How a content is surfaced in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Independently importable root
    Default,

    /// Container whose children are independently addressable
    Parent,

    /// Non-root leaf, reachable through a parent
    Visible,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Default => "Default",
            Visibility::Parent => "Parent",
            Visibility::Visible => "Visible",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Visibility::Default),
            "parent" => Ok(Visibility::Parent),
            "visible" => Ok(Visibility::Visible),
            _ => anyhow::bail!("Unknown visibility: {}", s),
        }
    }
}

/// A content unit persisted in the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Stable external identifier (unique key)
    pub identifier: String,

    /// Directory holding the materialized artifact, if any
    pub local_path: Option<PathBuf>,

    /// Number of parents (or root imports) referencing this content
    pub reference_count: u32,

    /// Artifact availability
    pub state: ContentState,

    /// Library visibility
    pub visibility: Visibility,

    pub mime_type: String,
    pub content_type: String,

    /// Version of the manifest this record was imported from
    pub manifest_version: String,

    /// Package version of the content
    pub package_version: Option<f64>,

    /// Bytes used on device (directory size, or children sum for collections)
    pub size_on_device: u64,

    pub audience: String,
    pub pragma: String,
    pub board: String,
    pub medium: String,
    pub grade: String,

    /// Full item document as received in the manifest
    pub raw_metadata: String,

    /// When this record was last written
    pub last_updated_at: DateTime<Utc>,
}

impl ContentRecord {
    /// Whether this record holds the given package version
    pub fn has_package_version(&self, version: Option<f64>) -> bool {
        match (self.package_version, version) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            (None, None) => true,
            _ => false,
        }
    }

    /// Whether this record is a collection
    pub fn is_collection(&self) -> bool {
        self.mime_type == COLLECTION_MIME_TYPE
    }

    /// Parse the stored item document
    pub fn metadata(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.raw_metadata).ok()
    }

    /// Identifiers of the direct children declared in the stored metadata
    pub fn child_identifiers(&self) -> Vec<String> {
        self.metadata()
            .map(|doc| super::manifest::child_identifiers_of(&doc))
            .unwrap_or_default()
    }
}
