//! Local file-system adapter backed by `tokio::fs`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use super::FileSystem;

/// File system of the device
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn create_dir(&self, path: &Path, fail_if_exists: bool) -> Result<PathBuf> {
        if fail_if_exists && fs::try_exists(path).await.unwrap_or(false) {
            anyhow::bail!("Directory already exists: {}", path.display());
        }

        fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        Ok(path.to_path_buf())
    }

    async fn copy_file(
        &self,
        src_dir: &Path,
        src_name: &str,
        dst_dir: &Path,
        dst_name: &str,
    ) -> Result<()> {
        let src = src_dir.join(src_name);
        let dst = dst_dir.join(dst_name);

        fs::create_dir_all(dst_dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", dst_dir.display()))?;
        fs::copy(&src, &dst)
            .await
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;

        Ok(())
    }

    async fn dir_size(&self, path: &Path) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![path.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    total += entry.metadata().await?.len();
                }
            }
        }

        Ok(total)
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat file: {}", path.display()))?;
        Ok(metadata.len())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }

    async fn temp_location(&self, base: &Path) -> Result<PathBuf> {
        let dir = base.join(Uuid::new_v4().to_string());
        self.create_dir(&dir, true).await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove directory: {}", path.display())),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .with_context(|| format!("Failed to read file: {}", path.display()))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write file: {}", path.display()))
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        // fs2 needs an existing path; walk up to the closest ancestor that exists
        let mut probe = path.to_path_buf();
        while !fs::try_exists(&probe).await.unwrap_or(false) {
            if !probe.pop() {
                anyhow::bail!("No existing ancestor for {}", path.display());
            }
        }

        tokio::task::spawn_blocking(move || fs2::available_space(&probe))
            .await
            .context("Free-space probe panicked")?
            .with_context(|| format!("Failed to query free space for {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dir_size_is_recursive() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();

        fs.write_file(&temp.path().join("a.txt"), b"12345").await.unwrap();
        fs.write_file(&temp.path().join("nested/deeper/b.txt"), b"123")
            .await
            .unwrap();

        assert_eq!(fs.dir_size(temp.path()).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_create_dir_fail_if_exists() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let dir = temp.path().join("content");

        fs.create_dir(&dir, true).await.unwrap();
        assert!(fs.create_dir(&dir, false).await.is_ok());
        assert!(fs.create_dir(&dir, true).await.is_err());
    }

    #[tokio::test]
    async fn test_temp_locations_are_unique() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();

        let first = fs.temp_location(temp.path()).await.unwrap();
        let second = fs.temp_location(temp.path()).await.unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with(temp.path()));
        assert!(fs.exists(&first).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();

        fs.remove_dir(&temp.path().join("never-created")).await.unwrap();
    }

    #[tokio::test]
    async fn test_available_space_for_missing_path() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();

        let space = fs
            .available_space(&temp.path().join("not/yet/there"))
            .await
            .unwrap();
        assert!(space > 0);
    }
}
