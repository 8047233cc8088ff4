//! Zip codec for content archives.
//!
//! Archives (and the artifact bundles nested inside them) are plain zip
//! files. The `zip` crate is synchronous, so every call runs on the blocking
//! pool.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::ArchiveService;

/// Zip implementation of `ArchiveService`
#[derive(Debug, Clone, Default)]
pub struct ZipArchiver;

impl ZipArchiver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveService for ZipArchiver {
    fn name(&self) -> &str {
        "zip"
    }

    async fn extract(&self, archive: &Path, target: &Path) -> Result<()> {
        let archive = archive.to_path_buf();
        let target = target.to_path_buf();

        tokio::task::spawn_blocking(move || extract_blocking(&archive, &target))
            .await
            .context("Extraction task panicked")?
    }

    async fn compress(&self, source_dir: &Path, target: &Path) -> Result<()> {
        let source_dir = source_dir.to_path_buf();
        let target = target.to_path_buf();

        tokio::task::spawn_blocking(move || compress_blocking(&source_dir, &target))
            .await
            .context("Compression task panicked")?
    }
}

fn extract_blocking(archive: &Path, target: &Path) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Not a valid archive: {}", archive.display()))?;

    std::fs::create_dir_all(target)
        .with_context(|| format!("Failed to create directory: {}", target.display()))?;

    // `extract` rejects entries that would escape `target`
    zip.extract(target)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;

    Ok(())
}

fn compress_blocking(source_dir: &Path, target: &Path) -> Result<()> {
    let files = collect_files(source_dir, target)?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let file = File::create(target)
        .with_context(|| format!("Failed to create archive: {}", target.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (relative, path) in files {
        zip.start_file(relative, options)?;
        let mut input = File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        std::io::copy(&mut input, &mut zip)
            .with_context(|| format!("Failed to add {} to archive", path.display()))?;
    }

    zip.finish().context("Failed to finalize archive")?;
    Ok(())
}

/// All files under `root` as (archive name, path), sorted, excluding `skip`
fn collect_files(root: &Path, skip: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path == skip {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((name, path));
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compress_then_extract_keeps_layout() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        std::fs::create_dir_all(source.join("do_1/assets")).unwrap();
        std::fs::write(source.join("manifest.json"), b"{}").unwrap();
        std::fs::write(source.join("do_1/assets/icon.png"), b"png").unwrap();

        let archiver = ZipArchiver::new();
        let archive = temp.path().join("bundle.ecar");
        archiver.compress(&source, &archive).await.unwrap();

        let target = temp.path().join("target");
        archiver.extract(&archive, &target).await.unwrap();

        assert_eq!(std::fs::read(target.join("manifest.json")).unwrap(), b"{}");
        assert_eq!(
            std::fs::read(target.join("do_1/assets/icon.png")).unwrap(),
            b"png"
        );
    }

    #[tokio::test]
    async fn test_compress_skips_target_inside_source() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"a").unwrap();

        let archive = temp.path().join("self.zip");
        std::fs::write(&archive, b"stale").unwrap();

        let files = collect_files(temp.path(), &archive).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "a.txt");
    }

    #[tokio::test]
    async fn test_extract_rejects_non_archive() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("broken.zip");
        std::fs::write(&bogus, b"definitely not a zip").unwrap();

        let result = ZipArchiver::new()
            .extract(&bogus, &temp.path().join("out"))
            .await;
        assert!(result.is_err());
    }
}
