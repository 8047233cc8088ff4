//! Shared fixtures for integration tests: archive builder, library setup,
//! and a file system wrapper that counts calls and fakes free space.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use shelf::adapters::{FileSystem, LocalFileSystem, ZipArchiver};
use shelf::domain::COLLECTION_MIME_TYPE;
use shelf::store::ContentBatch;
use shelf::{
    ContentEvent, ContentRecord, ContentState, ContentStore, LibrarySettings, Orchestrator,
    StorageLayout, Visibility,
};

/// A library rooted in its own temp directory
pub struct TestLibrary {
    pub temp: TempDir,
    pub orchestrator: Orchestrator,
}

impl TestLibrary {
    pub fn new() -> Self {
        Self::with_settings(LibrarySettings::default())
    }

    pub fn with_settings(settings: LibrarySettings) -> Self {
        Self::build(settings, Arc::new(LocalFileSystem::new()))
    }

    pub fn with_fs(fs: Arc<dyn FileSystem>) -> Self {
        Self::build(LibrarySettings::default(), fs)
    }

    fn build(settings: LibrarySettings, fs: Arc<dyn FileSystem>) -> Self {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(&temp.path().join("content.db")).unwrap();
        let layout = StorageLayout::under(temp.path());
        let orchestrator = Orchestrator::with_adapters(
            fs,
            Arc::new(ZipArchiver::new()),
            store,
            layout,
            settings,
        );
        Self { temp, orchestrator }
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp.path().join("content.db")
    }

    pub fn content_dir(&self, identifier: &str) -> PathBuf {
        self.orchestrator.layout().content_root.join(identifier)
    }

    pub async fn record(&self, identifier: &str) -> ContentRecord {
        self.orchestrator
            .get_content(identifier)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no record for {}", identifier))
    }

    pub async fn insert(&self, records: Vec<ContentRecord>) {
        let batch = ContentBatch {
            inserts: records,
            ..Default::default()
        };
        self.orchestrator.store().apply_batch(&batch).await.unwrap();
    }
}

/// Builds a content archive the way the authoring tools package them
pub struct ArchiveBuilder {
    version: String,
    items: Vec<Value>,
    entries: Vec<(String, Vec<u8>)>,
    manifest: bool,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            version: "1.1".to_string(),
            items: Vec::new(),
            entries: Vec::new(),
            manifest: true,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn item(mut self, doc: Value) -> Self {
        self.items.push(doc);
        self
    }

    pub fn entry(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.entries.push((name.to_string(), bytes));
        self
    }

    /// Bundle files as the `<id>/<id>.zip` artifact of an item
    pub fn artifact(self, identifier: &str, files: &[(&str, &[u8])]) -> Self {
        let name = format!("{identifier}/{identifier}.zip");
        self.entry(&name, zip_bytes(files))
    }

    /// An artifact entry that is not a valid zip
    pub fn broken_artifact(self, identifier: &str) -> Self {
        let name = format!("{identifier}/{identifier}.zip");
        self.entry(&name, b"definitely not a zip".to_vec())
    }

    pub fn without_manifest(mut self) -> Self {
        self.manifest = false;
        self
    }

    pub fn write_to(self, path: &Path) -> PathBuf {
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        if self.manifest {
            let manifest = json!({
                "id": "ekstep.content.archive",
                "ver": self.version,
                "ts": Utc::now().to_rfc3339(),
                "archive": { "count": self.items.len(), "ttl": 24, "items": self.items }
            });
            files.push(("manifest.json".to_string(), serde_json::to_vec(&manifest).unwrap()));
        }
        files.extend(self.entries);

        let borrowed: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        std::fs::write(path, zip_bytes(&borrowed)).unwrap();
        path.to_path_buf()
    }
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in files {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Collection item document
pub fn collection(identifier: &str, visibility: &str, children: &[&str]) -> Value {
    json!({
        "identifier": identifier,
        "name": identifier,
        "mimeType": COLLECTION_MIME_TYPE,
        "contentType": "TextBook",
        "visibility": visibility,
        "pkgVersion": 1,
        "compatibilityLevel": 1,
        "childNodes": children,
    })
}

/// Leaf item document with a gzip-inline artifact at `<id>/<id>.zip`
pub fn resource(identifier: &str, visibility: &str, pkg_version: f64) -> Value {
    json!({
        "identifier": identifier,
        "name": identifier,
        "mimeType": "application/pdf",
        "contentType": "Resource",
        "visibility": visibility,
        "pkgVersion": pkg_version,
        "compatibilityLevel": 1,
        "artifactUrl": format!("{identifier}/{identifier}.zip"),
        "contentEncoding": "gzip",
        "contentDisposition": "inline",
        "audience": ["Learner"],
        "board": "State",
    })
}

/// A stored record as an earlier import would have left it
pub fn stored_record(identifier: &str, visibility: Visibility, reference_count: u32) -> ContentRecord {
    ContentRecord {
        identifier: identifier.to_string(),
        local_path: None,
        reference_count,
        state: ContentState::ArtifactAvailable,
        visibility,
        mime_type: "application/pdf".to_string(),
        content_type: "resource".to_string(),
        manifest_version: "1.1".to_string(),
        package_version: Some(1.0),
        size_on_device: 0,
        audience: "Learner".to_string(),
        pragma: String::new(),
        board: String::new(),
        medium: String::new(),
        grade: String::new(),
        raw_metadata: resource(identifier, visibility.as_str(), 1.0).to_string(),
        last_updated_at: Utc::now(),
    }
}

/// All events currently buffered on a receiver
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<ContentEvent>) -> Vec<ContentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Local file system that counts calls and can report a fixed free space
pub struct InstrumentedFileSystem {
    inner: LocalFileSystem,
    calls: AtomicUsize,
    available: Option<u64>,
}

impl InstrumentedFileSystem {
    pub fn new() -> Self {
        Self {
            inner: LocalFileSystem::new(),
            calls: AtomicUsize::new(0),
            available: None,
        }
    }

    pub fn with_available_space(available: u64) -> Self {
        Self {
            available: Some(available),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FileSystem for InstrumentedFileSystem {
    async fn create_dir(&self, path: &Path, fail_if_exists: bool) -> Result<PathBuf> {
        self.hit();
        self.inner.create_dir(path, fail_if_exists).await
    }

    async fn copy_file(
        &self,
        src_dir: &Path,
        src_name: &str,
        dst_dir: &Path,
        dst_name: &str,
    ) -> Result<()> {
        self.hit();
        self.inner.copy_file(src_dir, src_name, dst_dir, dst_name).await
    }

    async fn dir_size(&self, path: &Path) -> Result<u64> {
        self.hit();
        self.inner.dir_size(path).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        self.hit();
        self.inner.file_size(path).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.hit();
        self.inner.exists(path).await
    }

    async fn temp_location(&self, base: &Path) -> Result<PathBuf> {
        self.hit();
        self.inner.temp_location(base).await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.hit();
        self.inner.remove_dir(path).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.hit();
        self.inner.read_file(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.hit();
        self.inner.write_file(path, contents).await
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        self.hit();
        match self.available {
            Some(available) => Ok(available),
            None => self.inner.available_space(path).await,
        }
    }
}
