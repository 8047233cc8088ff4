//! Failure taxonomy of the import and export pipelines.
//!
//! Per-item problems (a broken artifact, a missing icon) are recovered inside
//! the materializer and never reach this type. Everything here aborts the
//! operation it was raised in.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// Pipeline stages, for error reporting and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Validate,
    Materialize,
    WriteRootManifest,
    Cleanup,
    RecomputeSizes,
    PrepareTemp,
    BuildManifest,
    WriteManifest,
    Compress,
    VerifyDeviceSpace,
    CopyAssets,
    BundleArchive,
    DeleteTempArchive,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::Validate => "validate",
            Stage::Materialize => "materialize",
            Stage::WriteRootManifest => "write_root_manifest",
            Stage::Cleanup => "cleanup",
            Stage::RecomputeSizes => "recompute_sizes",
            Stage::PrepareTemp => "prepare_temp",
            Stage::BuildManifest => "build_manifest",
            Stage::WriteManifest => "write_manifest",
            Stage::Compress => "compress",
            Stage::VerifyDeviceSpace => "verify_device_space",
            Stage::CopyAssets => "copy_assets",
            Stage::BundleArchive => "bundle_archive",
            Stage::DeleteTempArchive => "delete_temp_archive",
        };
        f.write_str(name)
    }
}

/// Why an import or export failed
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("archive not found: {}", .0.display())]
    ArchiveNotFound(PathBuf),

    #[error("archive {} is corrupt: {reason}", path.display())]
    ArchiveCorrupt { path: PathBuf, reason: String },

    #[error("manifest is incompatible: {reason}")]
    ManifestIncompatible { reason: String },

    #[error("insufficient storage: {required} bytes required, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("nothing to export")]
    NothingToExport,

    #[error("record store write failed, transaction rolled back: {0}")]
    StoreWriteFailed(#[source] StoreError),

    #[error("pipeline aborted at {stage}: {source:#}")]
    PipelineAborted {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Wrap an unclassified failure raised at `stage`
    pub fn aborted(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::PipelineAborted {
            stage,
            source: source.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        PipelineError::ArchiveCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ArchiveNotFound(_) => "archive_not_found",
            PipelineError::ArchiveCorrupt { .. } => "archive_corrupt",
            PipelineError::ManifestIncompatible { .. } => "manifest_incompatible",
            PipelineError::InsufficientStorage { .. } => "insufficient_storage",
            PipelineError::NothingToExport => "nothing_to_export",
            PipelineError::StoreWriteFailed(_) => "store_write_failed",
            PipelineError::PipelineAborted { .. } => "pipeline_aborted",
        }
    }
}

/// Extension for tagging collaborator errors with the stage they failed in
pub trait StageContext<T> {
    fn at_stage(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T, E> StageContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn at_stage(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::aborted(stage, e))
    }
}
