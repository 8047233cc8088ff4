//! Library facade.
//!
//! Owns the shared collaborators (file system, archiver, record store, event
//! bus) and dispatches import, export and delete requests to their pipelines.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::adapters::{ArchiveService, FileSystem, LocalFileSystem, ZipArchiver};
use crate::config::ResolvedConfig;
use crate::domain::{
    ContentEvent, ContentNode, ContentRecord, DeleteRequest, DeleteResponse, ExportOutcome,
    ExportRequest, HierarchyInfo, ImportOutcome, ImportRequest,
};
use crate::error::PipelineError;
use crate::store::{ContentFilter, ContentStore, StoreError};

use super::event_bus::EventBus;
use super::settings::{LibrarySettings, StorageLayout};
use super::{delete, export, hierarchy, import};

/// Collaborators shared by every pipeline stage
pub struct Services {
    pub fs: Arc<dyn FileSystem>,
    pub archiver: Arc<dyn ArchiveService>,
    pub store: Arc<ContentStore>,
    pub events: EventBus,
    pub settings: LibrarySettings,
    pub layout: StorageLayout,
}

/// Entry point for content library operations
#[derive(Clone)]
pub struct Orchestrator {
    services: Arc<Services>,
}

impl Orchestrator {
    /// Create an orchestrator backed by the local disk and zip archives
    pub fn new(store: ContentStore, layout: StorageLayout, settings: LibrarySettings) -> Self {
        Self::with_adapters(
            Arc::new(LocalFileSystem::new()),
            Arc::new(ZipArchiver::new()),
            store,
            layout,
            settings,
        )
    }

    /// Create an orchestrator with explicit file system and archive adapters
    pub fn with_adapters(
        fs: Arc<dyn FileSystem>,
        archiver: Arc<dyn ArchiveService>,
        store: ContentStore,
        layout: StorageLayout,
        settings: LibrarySettings,
    ) -> Self {
        Self {
            services: Arc::new(Services {
                fs,
                archiver,
                store: Arc::new(store),
                events: EventBus::new(),
                settings,
                layout,
            }),
        }
    }

    /// Open the record store and storage layout named by the configuration
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let store = ContentStore::open(&config.database_path).with_context(|| {
            format!(
                "Failed to open content database: {}",
                config.database_path.display()
            )
        })?;
        let layout = StorageLayout::new(config.content_root.clone(), config.temp_dir.clone());

        Ok(Self::new(store, layout, config.library.clone()))
    }

    /// Receive progress and completion events
    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.services.events.subscribe()
    }

    pub fn store(&self) -> &ContentStore {
        &self.services.store
    }

    pub fn settings(&self) -> &LibrarySettings {
        &self.services.settings
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.services.layout
    }

    /// Import a content archive into the library
    #[instrument(skip(self, request), fields(archiver = self.services.archiver.name()))]
    pub async fn import_archive(&self, request: ImportRequest) -> Result<ImportOutcome, PipelineError> {
        import::run(&self.services, request).await
    }

    /// Export contents (and their descendants) into a single archive
    #[instrument(skip(self, request))]
    pub async fn export_content(&self, request: ExportRequest) -> Result<ExportOutcome, PipelineError> {
        export::run(&self.services, request).await
    }

    /// Delete or release contents; one response per request, in order
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn delete_content(&self, requests: Vec<DeleteRequest>) -> Result<Vec<DeleteResponse>> {
        let responses = delete::run(Arc::clone(&self.services), requests).await?;
        info!(count = responses.len(), "Delete requests processed");
        Ok(responses)
    }

    pub async fn get_content(&self, identifier: &str) -> Result<Option<ContentRecord>, StoreError> {
        self.services.store.get(identifier).await
    }

    pub async fn list_contents(&self, filter: &ContentFilter) -> Result<Vec<ContentRecord>, StoreError> {
        self.services.store.list(filter).await
    }

    /// A content with its stored descendants, `depth` levels deep (`None`
    /// for all)
    pub async fn child_contents(
        &self,
        identifier: &str,
        depth: Option<usize>,
    ) -> Result<Option<ContentNode>, StoreError> {
        hierarchy::child_contents(&self.services.store, identifier, depth).await
    }

    pub async fn next_content(
        &self,
        path: &[HierarchyInfo],
        current: &str,
    ) -> Result<Option<ContentNode>, StoreError> {
        hierarchy::next_content(&self.services.store, path, current).await
    }

    pub async fn previous_content(
        &self,
        path: &[HierarchyInfo],
        current: &str,
    ) -> Result<Option<ContentNode>, StoreError> {
        hierarchy::previous_content(&self.services.store, path, current).await
    }
}
