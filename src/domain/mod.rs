//! Domain types for the content library.
//!
//! This module contains the core data structures:
//! - Record: persisted content units
//! - Manifest: typed archive manifests
//! - Context: per-operation import/export state
//! - Events: progress and completion notifications
//! - Hierarchy: content trees and navigation paths

pub mod context;
pub mod events;
pub mod hierarchy;
pub mod manifest;
pub mod record;

// Re-export commonly used types
pub use context::{
    ArtifactEntry, AssetEntry, DeleteRequest, DeleteResponse, DeleteStatus, ExportContext,
    ExportOutcome, ExportRequest, ImportContext, ImportOutcome, ImportRequest,
};
pub use events::{ContentEvent, ContentEventKind};
pub use hierarchy::{ContentNode, HierarchyInfo};
pub use manifest::{
    archive_relative_path, is_plain_identifier, ArtifactMode, ContentDisposition, ContentEncoding,
    Manifest, ManifestError, ManifestItem, MANIFEST_FILE_NAME,
};
pub use record::{ContentRecord, ContentState, Visibility, COLLECTION_MIME_TYPE};
