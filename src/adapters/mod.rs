//! Adapter interfaces for the collaborators the pipelines drive.
//!
//! The import and export pipelines only talk to the file system and to the
//! archive codec through these traits, so tests can swap in failing or
//! recording implementations.

pub mod fs;
pub mod zip_archive;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

pub use fs::LocalFileSystem;
pub use zip_archive::ZipArchiver;

/// File-system operations used by the pipelines
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Create a directory (and its parents)
    ///
    /// Fails if `fail_if_exists` is set and the directory is already there.
    async fn create_dir(&self, path: &Path, fail_if_exists: bool) -> Result<PathBuf>;

    /// Copy `src_dir/src_name` to `dst_dir/dst_name`
    async fn copy_file(
        &self,
        src_dir: &Path,
        src_name: &str,
        dst_dir: &Path,
        dst_name: &str,
    ) -> Result<()>;

    /// Total size of all files under `path`
    async fn dir_size(&self, path: &Path) -> Result<u64>;

    /// Size of a single file
    async fn file_size(&self, path: &Path) -> Result<u64>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Allocate a fresh, empty working directory under `base`
    async fn temp_location(&self, base: &Path) -> Result<PathBuf>;

    /// Remove a directory tree; missing directories are not an error
    async fn remove_dir(&self, path: &Path) -> Result<()>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Free bytes on the volume holding `path`
    async fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Archive codec used to unpack and assemble content archives
#[async_trait]
pub trait ArchiveService: Send + Sync {
    /// Human-readable codec name
    fn name(&self) -> &str;

    /// Unpack `archive` into `target`
    async fn extract(&self, archive: &Path, target: &Path) -> Result<()>;

    /// Pack everything under `source_dir` into `target`
    async fn compress(&self, source_dir: &Path, target: &Path) -> Result<()>;
}
