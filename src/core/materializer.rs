//! Materialize stage of the import pipeline.
//!
//! Walks the manifest items that are not on the skip list, in manifest order,
//! and for each one:
//! - decides whether an existing record already holds this version
//! - places the artifact (unzip, byte copy, or nothing for online items)
//! - merges state, reference count, visibility and path with what is stored
//!
//! Per-item file-system failures degrade that item to spine-only (unless the
//! extraction policy says otherwise). All record writes are staged and applied
//! in one transaction at the end. The caller holds the store's batch lock
//! from validation through this stage.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::FileSystem;
use crate::domain::{
    archive_relative_path, ArtifactMode, ContentEventKind, ContentRecord, ContentState,
    ImportContext, Manifest, ManifestItem, Visibility,
};
use crate::error::{PipelineError, Stage, StageContext};
use crate::store::ContentBatch;

use super::orchestrator::Services;
use super::settings::ExtractionFailurePolicy;

/// Materialize all pending items and commit their records
#[instrument(skip_all, fields(operation_id = %ctx.operation_id))]
pub async fn materialize(
    services: &Services,
    mut ctx: ImportContext,
) -> Result<ImportContext, PipelineError> {
    let items: Vec<ManifestItem> = ctx.pending_items().cloned().collect();
    let total = items.len();
    let operation_id = ctx.operation_id;

    services
        .events
        .publish(operation_id, ContentEventKind::ImportProgress { current: 0, total });

    let mut identifiers: Vec<String> = Vec::with_capacity(total);
    for item in &items {
        if !identifiers.contains(&item.identifier) {
            identifiers.push(item.identifier.clone());
        }
    }
    let existing = services
        .store
        .fetch_many(&identifiers)
        .await
        .at_stage(Stage::Materialize)?;

    let mut staged = StagedWrites::default();
    let mut counted = match &ctx.manifest {
        Some(manifest) => already_counted(manifest, &existing, ctx.is_child_content),
        None => HashSet::new(),
    };

    for (index, item) in items.iter().enumerate() {
        let id = &item.identifier;
        let baseline = staged
            .get(id)
            .or_else(|| existing.get(id))
            .cloned();

        let outcome = materialize_item(
            services,
            &ctx,
            item,
            baseline.as_ref(),
            counted.contains(id),
        )
        .await?;
        counted.insert(id.clone());

        if item.visibility() == Visibility::Default {
            ctx.root_identifier = Some(id.clone());
            ctx.root_path = outcome.record.local_path.clone();
        } else if item.is_leaf() && !ctx.identifiers.contains(id) {
            ctx.identifiers.push(id.clone());
        }

        match outcome.write {
            Some(WriteKind::Insert) => staged.stage(outcome.record, true),
            Some(WriteKind::Update) => staged.stage(outcome.record, false),
            None => debug!(identifier = %id, "Record unchanged"),
        }

        services.events.publish(
            operation_id,
            ContentEventKind::ImportProgress {
                current: index + 1,
                total,
            },
        );
    }

    let batch = staged.into_batch();
    services
        .store
        .apply_batch(&batch)
        .await
        .map_err(PipelineError::StoreWriteFailed)?;

    ctx.imported = batch.inserts.len() + batch.updates.len();
    info!(
        inserted = batch.inserts.len(),
        updated = batch.updates.len(),
        "Materialized import batch"
    );

    Ok(ctx)
}

/// Reference count after this import
///
/// `counted` is set when the identifier already went through this run.
pub fn reference_count(
    existing: Option<&ContentRecord>,
    declared: Visibility,
    counted: bool,
    is_child_content: bool,
) -> u32 {
    match existing {
        None => 1,
        Some(record) if counted || is_child_content => record.reference_count,
        Some(record)
            if record.visibility == Visibility::Default && declared == Visibility::Default =>
        {
            record.reference_count
        }
        Some(record) => record.reference_count.saturating_add(1),
    }
}

/// Items already referenced by this archive's root on record
///
/// When the root is stored at the same package version but was not skipped
/// (its artifact never became available), the children stored at their
/// declared version were counted by the earlier import of this root.
pub fn already_counted(
    manifest: &Manifest,
    existing: &HashMap<String, ContentRecord>,
    is_child_content: bool,
) -> HashSet<String> {
    let stored_at_version = |item: &ManifestItem| {
        existing
            .get(&item.identifier)
            .is_some_and(|record| record.has_package_version(item.pkg_version))
    };

    match manifest.root() {
        Some(root) if !is_child_content && !root.is_draft() && stored_at_version(root) => manifest
            .items
            .iter()
            .filter(|item| item.identifier != root.identifier && stored_at_version(item))
            .map(|item| item.identifier.clone())
            .collect(),
        _ => HashSet::new(),
    }
}

/// Visibility after this import; a `Parent` never shrinks
pub fn resolve_visibility(
    item: &ManifestItem,
    existing: Option<&ContentRecord>,
    is_child_content: bool,
) -> Visibility {
    if item.is_library_object() {
        return Visibility::Parent;
    }

    match existing {
        Some(record) if is_child_content || record.visibility != Visibility::Parent => {
            record.visibility
        }
        Some(_) => Visibility::Parent,
        None => item.visibility(),
    }
}

/// Whether a merged record has to be written back
pub fn needs_update(
    previous: &ContentRecord,
    next: &ContentRecord,
    materialized: bool,
    is_collection: bool,
) -> bool {
    next.state > previous.state
        || materialized
        || is_collection
        || next.reference_count != previous.reference_count
        || next.visibility != previous.visibility
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
}

struct ItemOutcome {
    record: ContentRecord,
    write: Option<WriteKind>,
}

async fn materialize_item(
    services: &Services,
    ctx: &ImportContext,
    item: &ManifestItem,
    existing: Option<&ContentRecord>,
    counted: bool,
) -> Result<ItemOutcome, PipelineError> {
    let id = &item.identifier;
    let fs = services.fs.as_ref();
    let is_leaf = item.is_leaf();

    let reuse = existing.filter(|record| {
        record.has_package_version(item.pkg_version) && !item.is_draft()
    });

    let mut destination: Option<PathBuf> = None;
    let mut materialized = false;

    if reuse.is_none() {
        if is_leaf {
            let dir = ctx.item_dir(id);
            match fs.create_dir(&dir, false).await {
                Ok(dir) => destination = Some(dir),
                Err(e) => warn!(identifier = %id, error = %format!("{e:#}"), "No storage directory"),
            }
        }

        if services
            .settings
            .supports_compatibility_level(item.compatibility_level())
        {
            match place_artifact(services, ctx, item, destination.as_deref()).await {
                Ok(placed) => materialized = placed,
                Err(e) => match services.settings.extraction_failure_policy {
                    ExtractionFailurePolicy::Abort => {
                        return Err(PipelineError::aborted(
                            Stage::Materialize,
                            e.context(format!("Failed to materialize {}", id)),
                        ));
                    }
                    ExtractionFailurePolicy::RecordSpineOnly => {
                        warn!(
                            identifier = %id,
                            error = %format!("{e:#}"),
                            "Artifact not materialized, recording spine only"
                        );
                    }
                },
            }
        } else {
            debug!(
                identifier = %id,
                level = item.compatibility_level(),
                "Item needs a newer app, keeping spine only"
            );
        }

        if let (true, Some(dir)) = (is_leaf, destination.as_deref()) {
            copy_icon(fs, ctx, item, dir).await;
        }
    }

    let computed = if materialized || item.is_collection() {
        ContentState::ArtifactAvailable
    } else {
        ContentState::OnlySpine
    };
    let state = existing.map_or(computed, |record| record.state.merge(computed));

    let reference_count =
        reference_count(existing, item.visibility(), counted, ctx.is_child_content);
    let visibility = resolve_visibility(item, existing, ctx.is_child_content);

    let local_path = match (destination, reuse) {
        (Some(dir), None) => Some(dir),
        _ => existing.and_then(|record| record.local_path.clone()),
    };

    let size_on_device = match (&local_path, is_leaf) {
        (Some(path), true) => fs.dir_size(path).await.unwrap_or_else(|e| {
            debug!(identifier = %id, error = %format!("{e:#}"), "Size unavailable");
            0
        }),
        _ => 0,
    };

    let raw_metadata = match reuse {
        Some(record) => record.raw_metadata.clone(),
        None => item.raw.to_string(),
    };

    let record = ContentRecord {
        identifier: id.clone(),
        local_path,
        reference_count,
        state,
        visibility,
        mime_type: item.mime_type().to_string(),
        content_type: item.content_type(),
        manifest_version: ctx.manifest_version.clone(),
        package_version: item.pkg_version,
        size_on_device,
        audience: item.audience(),
        pragma: item.pragma(),
        board: item.board.join(","),
        medium: item.medium.join(","),
        grade: item.grade_level.join(","),
        raw_metadata,
        last_updated_at: Utc::now(),
    };

    let write = match existing {
        None => Some(WriteKind::Insert),
        Some(previous) if needs_update(previous, &record, materialized, item.is_collection()) => {
            Some(WriteKind::Update)
        }
        Some(_) => None,
    };

    Ok(ItemOutcome { record, write })
}

/// Place an item's artifact in its storage directory
///
/// Returns whether the artifact is now available.
async fn place_artifact(
    services: &Services,
    ctx: &ImportContext,
    item: &ManifestItem,
    destination: Option<&Path>,
) -> anyhow::Result<bool> {
    let Some(url) = item.artifact_url.as_deref().filter(|url| !url.is_empty()) else {
        return Ok(false);
    };

    let mode = item.artifact_mode();
    match mode {
        ArtifactMode::Online => return Ok(true),
        ArtifactMode::Unsupported => {
            debug!(
                identifier = %item.identifier,
                disposition = ?item.content_disposition,
                encoding = ?item.content_encoding,
                "Artifact packaging not handled on this device, keeping spine only"
            );
            return Ok(false);
        }
        ArtifactMode::Extract | ArtifactMode::Copy => {}
    }

    let dir = destination.context("No storage directory for artifact")?;
    if mode == ArtifactMode::Extract {
        let entry = ctx
            .entry_path(url)
            .with_context(|| format!("Artifact path leaves the archive: {}", url))?;
        services.archiver.extract(&entry, dir).await?;
    } else {
        copy_relative(services.fs.as_ref(), &ctx.work_dir, url, dir).await?;
    }

    Ok(true)
}

/// Best-effort copy of a bundled icon next to the artifact
async fn copy_icon(fs: &dyn FileSystem, ctx: &ImportContext, item: &ManifestItem, dir: &Path) {
    let Some(icon) = item
        .app_icon
        .as_deref()
        .filter(|icon| !icon.is_empty() && !icon.starts_with("https:"))
    else {
        return;
    };

    if let Err(e) = copy_relative(fs, &ctx.work_dir, icon, dir).await {
        debug!(identifier = %item.identifier, icon, error = %format!("{e:#}"), "Icon not copied");
    }
}

/// Copy `base/relative` to `target/relative`, keeping the folder structure
async fn copy_relative(
    fs: &dyn FileSystem,
    base: &Path,
    relative: &str,
    target: &Path,
) -> anyhow::Result<()> {
    let path = archive_relative_path(relative)
        .with_context(|| format!("Path leaves the archive: {}", relative))?;
    let file = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("No file name in {}", relative))?;
    let folder = path.parent().unwrap_or_else(|| Path::new(""));

    fs.copy_file(&base.join(folder), file, &target.join(folder), file)
        .await
}

/// Writes accumulated over one run, in first-seen order
///
/// A repeated identifier replaces its earlier entry but keeps whether it is
/// an insert, so nothing is inserted twice.
#[derive(Default)]
struct StagedWrites {
    order: Vec<String>,
    entries: HashMap<String, (ContentRecord, bool)>,
}

impl StagedWrites {
    fn get(&self, identifier: &str) -> Option<&ContentRecord> {
        self.entries.get(identifier).map(|(record, _)| record)
    }

    fn stage(&mut self, record: ContentRecord, insert: bool) {
        match self.entries.get_mut(&record.identifier) {
            Some((slot, _)) => *slot = record,
            None => {
                self.order.push(record.identifier.clone());
                self.entries
                    .insert(record.identifier.clone(), (record, insert));
            }
        }
    }

    fn into_batch(mut self) -> ContentBatch {
        let mut batch = ContentBatch::new();
        for id in self.order {
            if let Some((record, insert)) = self.entries.remove(&id) {
                if insert {
                    batch.inserts.push(record);
                } else {
                    batch.updates.push(record);
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(visibility: Visibility, reference_count: u32) -> ContentRecord {
        ContentRecord {
            identifier: "do_1".to_string(),
            local_path: Some(PathBuf::from("/content/do_1")),
            reference_count,
            state: ContentState::OnlySpine,
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
            raw_metadata: "{}".to_string(),
            last_updated_at: Utc::now(),
        }
    }

    fn item(doc: serde_json::Value) -> ManifestItem {
        ManifestItem::from_value(doc).unwrap()
    }

    #[test]
    fn test_reference_count_rules() {
        let visible = stored(Visibility::Visible, 1);
        let root = stored(Visibility::Default, 1);

        assert_eq!(reference_count(None, Visibility::Visible, false, false), 1);
        assert_eq!(reference_count(Some(&visible), Visibility::Visible, false, false), 2);
        assert_eq!(reference_count(Some(&visible), Visibility::Visible, true, false), 1);
        assert_eq!(reference_count(Some(&visible), Visibility::Visible, false, true), 1);
        assert_eq!(reference_count(Some(&root), Visibility::Default, false, false), 1);
        assert_eq!(reference_count(Some(&root), Visibility::Visible, false, false), 2);
    }

    fn book(root_version: u32) -> Manifest {
        let doc = json!({
            "ver": "1.1",
            "archive": { "items": [
                { "identifier": "do_root", "visibility": "Default", "pkgVersion": root_version },
                { "identifier": "do_1", "visibility": "Visible", "pkgVersion": 1 },
                { "identifier": "do_2", "visibility": "Visible", "pkgVersion": 3 }
            ]}
        });
        Manifest::parse(&serde_json::to_vec(&doc).unwrap()).unwrap()
    }

    #[test]
    fn test_children_of_stored_root_are_already_counted() {
        let mut root = stored(Visibility::Default, 1);
        root.identifier = "do_root".to_string();
        let existing: HashMap<String, ContentRecord> = [
            ("do_root".to_string(), root),
            ("do_1".to_string(), stored(Visibility::Visible, 1)),
        ]
        .into_iter()
        .collect();

        let counted = already_counted(&book(1), &existing, false);
        assert_eq!(counted, HashSet::from(["do_1".to_string()]));

        // A new root version references its children anew
        assert!(already_counted(&book(2), &existing, false).is_empty());
        assert!(already_counted(&book(1), &existing, true).is_empty());
        assert!(already_counted(&book(1), &HashMap::new(), false).is_empty());
    }

    #[test]
    fn test_library_objects_become_parents() {
        let library = item(json!({ "identifier": "do_1", "objectType": "Library", "visibility": "Default" }));
        assert_eq!(resolve_visibility(&library, None, false), Visibility::Parent);
    }

    #[test]
    fn test_existing_visibility_wins() {
        let declared_default = item(json!({ "identifier": "do_1", "visibility": "Default" }));
        let visible = stored(Visibility::Visible, 1);

        assert_eq!(resolve_visibility(&declared_default, None, false), Visibility::Default);
        assert_eq!(
            resolve_visibility(&declared_default, Some(&visible), false),
            Visibility::Visible
        );
    }

    #[test]
    fn test_parent_never_shrinks() {
        let parent = stored(Visibility::Parent, 1);
        let declared_visible = item(json!({ "identifier": "do_1", "visibility": "Visible" }));

        assert_eq!(
            resolve_visibility(&declared_visible, Some(&parent), false),
            Visibility::Parent
        );
        assert_eq!(
            resolve_visibility(&declared_visible, Some(&parent), true),
            Visibility::Parent
        );
    }

    #[test]
    fn test_unchanged_spine_leaf_is_not_rewritten() {
        let previous = stored(Visibility::Visible, 1);
        let next = previous.clone();

        assert!(!needs_update(&previous, &next, false, false));
        assert!(needs_update(&previous, &next, true, false));
        assert!(needs_update(&previous, &next, false, true));

        let mut upgraded = previous.clone();
        upgraded.state = ContentState::ArtifactAvailable;
        assert!(needs_update(&previous, &upgraded, false, false));

        let mut shared = previous.clone();
        shared.reference_count = 2;
        assert!(needs_update(&previous, &shared, false, false));
    }

    #[test]
    fn test_staged_writes_keep_insert_for_repeats() {
        let mut staged = StagedWrites::default();
        let first = stored(Visibility::Visible, 1);
        let mut second = first.clone();
        second.reference_count = 5;

        staged.stage(first, true);
        staged.stage(second, false);

        let batch = staged.into_batch();
        assert_eq!(batch.inserts.len(), 1);
        assert!(batch.updates.is_empty());
        assert_eq!(batch.inserts[0].reference_count, 5);
    }
}
