//! Import pipeline.
//!
//! `Extract → Validate → Materialize → WriteRootManifest → Cleanup →
//! RecomputeSizes`, terminal on the first failure. The working directory is
//! removed best-effort when a stage fails.

use std::collections::HashMap;

use tracing::{info, instrument, warn};

use crate::domain::{ContentEventKind, ImportContext, ImportOutcome, ImportRequest, MANIFEST_FILE_NAME};
use crate::error::{PipelineError, Stage, StageContext};

use super::extractor;
use super::materializer;
use super::orchestrator::Services;

/// Run the import pipeline for one archive
#[instrument(skip_all, fields(source = %request.source.display(), child = request.is_child_content))]
pub async fn run(services: &Services, request: ImportRequest) -> Result<ImportOutcome, PipelineError> {
    let destination = request
        .destination
        .clone()
        .unwrap_or_else(|| services.layout.content_root.clone());
    let ctx = ImportContext::new(request, destination);
    let operation_id = ctx.operation_id;

    info!(%operation_id, "Starting import");

    let mut stage = Stage::Extract;
    let mut work_dir = None;

    match run_stages(services, ctx, &mut stage, &mut work_dir).await {
        Ok(ctx) => {
            let outcome = ImportOutcome {
                operation_id,
                root_identifier: ctx.root_identifier,
                identifiers: ctx.identifiers,
                imported: ctx.imported,
                skipped: ctx.skipped.len(),
            };

            services.events.publish(
                operation_id,
                ContentEventKind::ImportCompleted {
                    root_identifier: outcome.root_identifier.clone(),
                    imported: outcome.imported,
                    skipped: outcome.skipped,
                },
            );
            info!(
                imported = outcome.imported,
                skipped = outcome.skipped,
                "Import completed"
            );
            Ok(outcome)
        }
        Err(e) => {
            if let Some(dir) = work_dir {
                if let Err(cleanup) = services.fs.remove_dir(&dir).await {
                    warn!(error = %format!("{cleanup:#}"), "Failed to remove working directory");
                }
            }

            warn!(%stage, error = %e, "Import failed");
            services.events.publish(
                operation_id,
                ContentEventKind::ImportFailed {
                    stage: stage.to_string(),
                    error: e.to_string(),
                },
            );
            Err(e)
        }
    }
}

async fn run_stages(
    services: &Services,
    mut ctx: ImportContext,
    stage: &mut Stage,
    work_dir: &mut Option<std::path::PathBuf>,
) -> Result<ImportContext, PipelineError> {
    let dir = services
        .fs
        .temp_location(&services.layout.temp_dir)
        .await
        .at_stage(Stage::Extract)?;
    *work_dir = Some(dir.clone());
    ctx.work_dir = dir;

    let ctx = extractor::extract(services, ctx).await?;

    // Held from the skip-list lookup through the batch commit
    let batch_guard = services.store.lock_batch().await;

    *stage = Stage::Validate;
    let ctx = extractor::validate(services, ctx).await?;

    *stage = Stage::Materialize;
    let ctx = materializer::materialize(services, ctx).await?;
    drop(batch_guard);

    *stage = Stage::WriteRootManifest;
    let ctx = write_root_manifest(services, ctx).await?;

    *stage = Stage::Cleanup;
    let ctx = cleanup(services, ctx).await?;

    *stage = Stage::RecomputeSizes;
    recompute_sizes(services, ctx).await
}

/// Copy the archive manifest into the root's storage directory
async fn write_root_manifest(
    services: &Services,
    ctx: ImportContext,
) -> Result<ImportContext, PipelineError> {
    if let Some(root_path) = &ctx.root_path {
        services
            .fs
            .copy_file(&ctx.work_dir, MANIFEST_FILE_NAME, root_path, MANIFEST_FILE_NAME)
            .await
            .at_stage(Stage::WriteRootManifest)?;
    }
    Ok(ctx)
}

async fn cleanup(services: &Services, ctx: ImportContext) -> Result<ImportContext, PipelineError> {
    services
        .fs
        .remove_dir(&ctx.work_dir)
        .await
        .at_stage(Stage::Cleanup)?;
    Ok(ctx)
}

/// Refresh on-device sizes of everything this import touched
///
/// Leaves take their directory size. Collections take the sum of their
/// children, computed bottom-up by walking the manifest in reverse.
async fn recompute_sizes(
    services: &Services,
    ctx: ImportContext,
) -> Result<ImportContext, PipelineError> {
    let touched: Vec<_> = ctx.pending_items().collect();
    if touched.is_empty() {
        return Ok(ctx);
    }

    let mut lookup: Vec<String> = Vec::new();
    for item in &touched {
        lookup.push(item.identifier.clone());
        lookup.extend(item.child_identifiers());
    }
    lookup.sort();
    lookup.dedup();

    let records = services
        .store
        .fetch_many(&lookup)
        .await
        .at_stage(Stage::RecomputeSizes)?;

    let mut sizes: HashMap<String, u64> = HashMap::new();
    let mut updates: Vec<(String, u64)> = Vec::new();

    for item in touched.iter().rev() {
        let Some(record) = records.get(&item.identifier) else {
            continue;
        };

        let size = if item.is_collection() {
            item.child_identifiers()
                .iter()
                .map(|child| {
                    sizes
                        .get(child)
                        .copied()
                        .or_else(|| records.get(child).map(|r| r.size_on_device))
                        .unwrap_or(0)
                })
                .sum()
        } else {
            match &record.local_path {
                Some(path) => services.fs.dir_size(path).await.unwrap_or(0),
                None => 0,
            }
        };

        sizes.insert(item.identifier.clone(), size);
        if size != record.size_on_device {
            updates.push((item.identifier.clone(), size));
        }
    }

    services
        .store
        .update_sizes(&updates)
        .await
        .at_stage(Stage::RecomputeSizes)?;

    Ok(ctx)
}
