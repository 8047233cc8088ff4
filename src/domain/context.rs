//! Per-operation contexts threaded through the import and export pipelines.
//!
//! A context is created for one invocation, passed by value from stage to
//! stage, and dropped when the pipeline ends. Nothing in here is shared
//! between concurrent operations.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::manifest::{archive_relative_path, Manifest, ManifestItem};
use super::record::ContentRecord;

/// Request to import one archive
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Archive file to import
    pub source: PathBuf,

    /// Content root to materialize into (configured root when `None`)
    pub destination: Option<PathBuf>,

    /// Import was started from inside a parent content
    pub is_child_content: bool,
}

impl ImportRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            is_child_content: false,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn as_child_content(mut self) -> Self {
        self.is_child_content = true;
        self
    }
}

/// State of one in-flight import
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub operation_id: Uuid,

    /// Archive being imported
    pub source: PathBuf,

    /// Content root; leaves land in `<destination>/<identifier>`
    pub destination: PathBuf,

    /// Working directory the archive is unpacked into (allocated by the
    /// pipeline before extraction)
    pub work_dir: PathBuf,

    pub is_child_content: bool,

    /// Parsed manifest (set by the extract stage)
    pub manifest: Option<Manifest>,

    /// Manifest format version
    pub manifest_version: String,

    /// Identifiers already imported at the same version
    pub skipped: HashSet<String>,

    /// Identifier of the `Default`-visibility root, if the archive has one
    pub root_identifier: Option<String>,

    /// Storage directory resolved for the root
    pub root_path: Option<PathBuf>,

    /// Non-root leaf identifiers touched by this import
    pub identifiers: Vec<String>,

    /// Number of records written by the materializer
    pub imported: usize,
}

impl ImportContext {
    pub fn new(request: ImportRequest, destination: PathBuf) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            source: request.source,
            destination,
            work_dir: PathBuf::new(),
            is_child_content: request.is_child_content,
            manifest: None,
            manifest_version: String::new(),
            skipped: HashSet::new(),
            root_identifier: None,
            root_path: None,
            identifiers: Vec::new(),
            imported: 0,
        }
    }

    /// Manifest items in manifest order (empty before extraction)
    pub fn items(&self) -> &[ManifestItem] {
        self.manifest
            .as_ref()
            .map(|m| m.items.as_slice())
            .unwrap_or_default()
    }

    /// Items that still need to be materialized
    pub fn pending_items(&self) -> impl Iterator<Item = &ManifestItem> + '_ {
        self.items()
            .iter()
            .filter(move |item| !self.skipped.contains(&item.identifier))
    }

    /// Path of an archive entry inside the working directory, `None` if the
    /// entry name points outside of it
    pub fn entry_path(&self, relative: &str) -> Option<PathBuf> {
        archive_relative_path(relative).map(|path| self.work_dir.join(path))
    }

    /// Storage directory of a leaf; identifiers are plain names (checked at
    /// manifest parse time)
    pub fn item_dir(&self, identifier: &str) -> PathBuf {
        self.destination.join(identifier)
    }
}

/// Result of a successful import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub operation_id: Uuid,

    /// Root identifier, absent for child-content imports without a root
    pub root_identifier: Option<String>,

    /// Non-root leaf identifiers touched
    pub identifiers: Vec<String>,

    /// Records written (inserted or updated)
    pub imported: usize,

    /// Items skipped because they were already imported at this version
    pub skipped: usize,
}

/// Request to export local content into an archive
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Root identifiers to export (descendants are included)
    pub identifiers: Vec<String>,

    /// Folder the archive is written to
    pub destination: PathBuf,
}

impl ExportRequest {
    pub fn new(identifiers: Vec<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            identifiers,
            destination: destination.into(),
        }
    }
}

/// One artifact directory to compress into the archive
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEntry {
    pub identifier: String,

    /// Local content directory
    pub source_dir: PathBuf,

    /// Archive-relative path of the compressed artifact
    pub archive_path: String,
}

/// One icon to copy into the archive
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEntry {
    pub identifier: String,

    /// Icon file on disk
    pub source: PathBuf,

    /// Archive-relative destination
    pub archive_path: String,
}

/// State of one in-flight export
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub operation_id: Uuid,

    /// Identifiers the caller asked for
    pub requested: Vec<String>,

    /// Requested records plus their descendants
    pub records: Vec<ContentRecord>,

    /// Working directory the archive is assembled in
    pub work_dir: PathBuf,

    /// Folder the final archive is written to
    pub destination: PathBuf,

    /// Final archive path (set when the manifest is built)
    pub archive_path: PathBuf,

    /// Manifest to write
    pub manifest: Option<Manifest>,

    /// Artifacts to compress
    pub artifacts: Vec<ArtifactEntry>,

    /// Icons to copy
    pub assets: Vec<AssetEntry>,

    /// Compressed artifact sizes by identifier
    pub artifact_sizes: BTreeMap<String, u64>,

    /// Size of the written manifest file
    pub manifest_size: u64,

    /// Free-form export metadata (`content_count`, ...)
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// SHA-256 of the bundled archive
    pub checksum: Option<String>,

    /// Size of the bundled archive
    pub archive_size: u64,
}

impl ExportContext {
    pub fn new(request: ExportRequest, work_dir: PathBuf) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            requested: request.identifiers,
            records: Vec::new(),
            work_dir,
            archive_path: request.destination.clone(),
            destination: request.destination,
            manifest: None,
            artifacts: Vec::new(),
            assets: Vec::new(),
            artifact_sizes: BTreeMap::new(),
            manifest_size: 0,
            metadata: BTreeMap::new(),
            checksum: None,
            archive_size: 0,
        }
    }

    /// Bytes the assembled archive is expected to need
    pub fn required_bytes(&self) -> u64 {
        self.artifact_sizes.values().sum::<u64>() + self.manifest_size
    }

    pub fn work_path(&self, relative: &str) -> PathBuf {
        self.work_dir.join(relative)
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

/// Result of a successful export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub operation_id: Uuid,
    pub archive_path: PathBuf,
    pub content_count: usize,
    pub size_bytes: u64,

    /// Hex SHA-256 of the archive
    pub checksum: String,
}

/// Request to delete one content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub identifier: String,

    /// Delete was started from inside a parent content
    #[serde(default)]
    pub is_child_content: bool,
}

impl DeleteRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            is_child_content: false,
        }
    }

    pub fn as_child_content(mut self) -> Self {
        self.is_child_content = true;
        self
    }
}

/// Outcome of deleting one content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    /// Record and files removed
    Deleted,

    /// Still referenced elsewhere; reference count decremented
    Released,

    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub identifier: String,
    pub status: DeleteStatus,
}
