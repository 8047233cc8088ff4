//! Tunables and storage layout for the import and export pipelines.
//!
//! Everything here is passed explicitly into the orchestrator; no pipeline
//! reads global state. Limits are loaded from the `library` section of the
//! config file:
//! - Maximum producer compatibility level
//! - Accepted manifest versions
//! - What to do when a single artifact fails to extract
//! - Free-space margin required on top of an export's estimated size

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What happens to an item whose artifact cannot be placed on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionFailurePolicy {
    /// Keep the metadata and record the item as spine-only
    #[default]
    RecordSpineOnly,

    /// Abort the whole import
    Abort,
}

/// Pipeline limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibrarySettings {
    /// Highest producer compatibility level this device understands (default: 5)
    #[serde(default = "default_max_compatibility_level")]
    pub max_compatibility_level: u32,

    /// Manifest versions accepted on import (default: 1.0, 1.1)
    #[serde(default = "default_manifest_versions")]
    pub supported_manifest_versions: Vec<String>,

    /// Handling of per-item extraction failures (default: record_spine_only)
    #[serde(default)]
    pub extraction_failure_policy: ExtractionFailurePolicy,

    /// Extra free bytes required at the export destination (default: 1MB)
    #[serde(default = "default_space_margin")]
    pub space_margin_bytes: u64,
}

fn default_max_compatibility_level() -> u32 {
    5
}

fn default_manifest_versions() -> Vec<String> {
    vec!["1.0".to_string(), "1.1".to_string()]
}

fn default_space_margin() -> u64 {
    1024 * 1024
} // 1MB

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            max_compatibility_level: default_max_compatibility_level(),
            supported_manifest_versions: default_manifest_versions(),
            extraction_failure_policy: ExtractionFailurePolicy::default(),
            space_margin_bytes: default_space_margin(),
        }
    }
}

impl LibrarySettings {
    pub fn supports_manifest_version(&self, version: &str) -> bool {
        self.supported_manifest_versions.iter().any(|v| v == version)
    }

    pub fn supports_compatibility_level(&self, level: u32) -> bool {
        level <= self.max_compatibility_level
    }

    pub fn with_extraction_failure_policy(mut self, policy: ExtractionFailurePolicy) -> Self {
        self.extraction_failure_policy = policy;
        self
    }
}

/// Where content and scratch space live on this device
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLayout {
    /// One directory per leaf identifier
    pub content_root: PathBuf,

    /// Parent of per-operation working directories
    pub temp_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(content_root: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
            temp_dir: temp_dir.into(),
        }
    }

    /// Layout with `content/` and `tmp/` under a single base directory
    pub fn under(base: &Path) -> Self {
        Self::new(base.join("content"), base.join("tmp"))
    }
}
