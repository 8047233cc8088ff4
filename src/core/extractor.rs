//! Extract and Validate stages of the import pipeline.
//!
//! Extraction unpacks the archive into the operation's working directory and
//! parses its manifest. Validation decides whether this device can import the
//! archive at all and which items were already imported at the same version.

use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use tracing::{debug, info, instrument};

use crate::domain::{ContentRecord, ContentState, ImportContext, Manifest, ManifestItem, MANIFEST_FILE_NAME};
use crate::error::{PipelineError, Stage, StageContext};

use super::orchestrator::Services;
use super::settings::LibrarySettings;

/// Unpack the archive and load its manifest
#[instrument(skip_all, fields(source = %ctx.source.display()))]
pub async fn extract(
    services: &Services,
    mut ctx: ImportContext,
) -> Result<ImportContext, PipelineError> {
    let fs = &services.fs;

    if !fs.exists(&ctx.source).await.at_stage(Stage::Extract)? {
        return Err(PipelineError::ArchiveNotFound(ctx.source.clone()));
    }

    services
        .archiver
        .extract(&ctx.source, &ctx.work_dir)
        .await
        .map_err(|e| PipelineError::corrupt(ctx.source.clone(), format!("{e:#}")))?;

    let manifest_path = ctx.work_dir.join(MANIFEST_FILE_NAME);
    if !fs.exists(&manifest_path).await.at_stage(Stage::Extract)? {
        return Err(PipelineError::corrupt(
            ctx.source.clone(),
            format!("{} is missing", MANIFEST_FILE_NAME),
        ));
    }

    let bytes = fs
        .read_file(&manifest_path)
        .await
        .map_err(|e| PipelineError::corrupt(ctx.source.clone(), format!("{e:#}")))?;
    let manifest =
        Manifest::parse(&bytes).map_err(|e| PipelineError::corrupt(ctx.source.clone(), e))?;

    info!(
        items = manifest.items.len(),
        version = %manifest.version,
        "Archive extracted"
    );

    ctx.manifest_version = manifest.version.clone();
    ctx.manifest = Some(manifest);
    Ok(ctx)
}

/// Check compatibility and compute the skip list
#[instrument(skip_all, fields(child = ctx.is_child_content))]
pub async fn validate(
    services: &Services,
    mut ctx: ImportContext,
) -> Result<ImportContext, PipelineError> {
    let (skipped, skipped_root) = {
        let manifest = ctx
            .manifest
            .as_ref()
            .ok_or_else(|| PipelineError::aborted(Stage::Validate, anyhow!("manifest was not loaded")))?;

        check_compatibility(&services.settings, manifest)?;

        let lookup: Vec<String> = if ctx.is_child_content {
            manifest.items.iter().map(|i| i.identifier.clone()).collect()
        } else {
            manifest.root().map(|r| r.identifier.clone()).into_iter().collect()
        };
        let existing = services
            .store
            .fetch_many(&lookup)
            .await
            .at_stage(Stage::Validate)?;

        let skipped = skip_list(manifest, &existing, ctx.is_child_content);
        let skipped_root = manifest
            .root()
            .filter(|root| skipped.contains(&root.identifier))
            .map(|root| root.identifier.clone());
        (skipped, skipped_root)
    };

    if !skipped.is_empty() {
        debug!(count = skipped.len(), "Items already imported at this version");
    }
    if !ctx.is_child_content {
        ctx.root_identifier = skipped_root;
    }
    ctx.skipped = skipped;

    Ok(ctx)
}

/// Reject manifests this device cannot read
pub fn check_compatibility(
    settings: &LibrarySettings,
    manifest: &Manifest,
) -> Result<(), PipelineError> {
    if !settings.supports_manifest_version(&manifest.version) {
        return Err(PipelineError::ManifestIncompatible {
            reason: format!("manifest version {} is not supported", manifest.version),
        });
    }

    let Some(first) = manifest.items.first() else {
        return Err(PipelineError::ManifestIncompatible {
            reason: "archive has no content items".to_string(),
        });
    };

    let root = manifest.root().unwrap_or(first);
    let level = root.compatibility_level();
    if !settings.supports_compatibility_level(level) {
        return Err(PipelineError::ManifestIncompatible {
            reason: format!(
                "{} needs compatibility level {}, device supports up to {}",
                root.identifier, level, settings.max_compatibility_level
            ),
        });
    }

    Ok(())
}

/// Identifiers that need no work because they are already imported
///
/// A regular import is all-or-nothing: if the root is already available at
/// this version, the whole archive is skipped. A child-content import skips
/// item by item.
pub fn skip_list(
    manifest: &Manifest,
    existing: &HashMap<String, ContentRecord>,
    is_child_content: bool,
) -> HashSet<String> {
    if is_child_content {
        return manifest
            .items
            .iter()
            .filter(|item| already_imported(item, existing))
            .map(|item| item.identifier.clone())
            .collect();
    }

    match manifest.root() {
        Some(root) if already_imported(root, existing) => manifest
            .items
            .iter()
            .map(|item| item.identifier.clone())
            .collect(),
        _ => HashSet::new(),
    }
}

fn already_imported(item: &ManifestItem, existing: &HashMap<String, ContentRecord>) -> bool {
    !item.is_draft()
        && existing.get(&item.identifier).is_some_and(|record| {
            record.has_package_version(item.pkg_version)
                && record.state == ContentState::ArtifactAvailable
        })
}
