//! Export pipeline.
//!
//! `PrepareTemp → BuildManifest → WriteManifest → Compress →
//! VerifyDeviceSpace → CopyAssets → BundleArchive → DeleteTempArchive`.
//! The device-space check runs after the per-artifact bundles exist (so their
//! real sizes are known) and before the final archive is assembled.

use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    ContentEventKind, ExportContext, ExportOutcome, ExportRequest, Manifest, MANIFEST_FILE_NAME,
};
use crate::error::{PipelineError, Stage, StageContext};

use super::orchestrator::Services;
use super::packer;

/// Run the export pipeline
#[instrument(skip_all, fields(count = request.identifiers.len(), destination = %request.destination.display()))]
pub async fn run(services: &Services, request: ExportRequest) -> Result<ExportOutcome, PipelineError> {
    if request.identifiers.is_empty() {
        return Err(PipelineError::NothingToExport);
    }

    let work_dir = services
        .layout
        .temp_dir
        .join(format!("export-{}", Uuid::new_v4()));
    let ctx = ExportContext::new(request, work_dir.clone());
    let operation_id = ctx.operation_id;

    info!(%operation_id, "Starting export");

    let mut stage = Stage::PrepareTemp;
    match run_stages(services, ctx, &mut stage).await {
        Ok(ctx) => {
            let content_count = ctx.records.len();
            services.events.publish(
                operation_id,
                ContentEventKind::ExportCompleted {
                    archive_path: ctx.archive_path.clone(),
                    content_count,
                },
            );
            info!(
                archive = %ctx.archive_path.display(),
                content_count,
                size = ctx.archive_size,
                "Export completed"
            );

            Ok(ExportOutcome {
                operation_id,
                archive_path: ctx.archive_path,
                content_count,
                size_bytes: ctx.archive_size,
                checksum: ctx.checksum.unwrap_or_default(),
            })
        }
        Err(e) => {
            if let Err(cleanup) = services.fs.remove_dir(&work_dir).await {
                warn!(error = %format!("{cleanup:#}"), "Failed to remove export working directory");
            }
            warn!(%stage, error = %e, "Export failed");
            Err(e)
        }
    }
}

async fn run_stages(
    services: &Services,
    ctx: ExportContext,
    stage: &mut Stage,
) -> Result<ExportContext, PipelineError> {
    let ctx = prepare_temp(services, ctx).await?;

    *stage = Stage::BuildManifest;
    let ctx = build_manifest(services, ctx).await?;

    *stage = Stage::WriteManifest;
    let ctx = write_manifest(services, ctx).await?;

    *stage = Stage::Compress;
    let ctx = compress(services, ctx).await?;

    *stage = Stage::VerifyDeviceSpace;
    let ctx = verify_device_space(services, ctx).await?;

    *stage = Stage::CopyAssets;
    let ctx = copy_assets(services, ctx).await?;

    *stage = Stage::BundleArchive;
    let ctx = bundle_archive(services, ctx).await?;

    *stage = Stage::DeleteTempArchive;
    delete_temp_archive(services, ctx).await
}

/// Clean and create the working directory
async fn prepare_temp(
    services: &Services,
    ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    services
        .fs
        .remove_dir(&ctx.work_dir)
        .await
        .at_stage(Stage::PrepareTemp)?;
    services
        .fs
        .create_dir(&ctx.work_dir, true)
        .await
        .at_stage(Stage::PrepareTemp)?;
    Ok(ctx)
}

/// Load the records and turn them into manifest items
async fn build_manifest(
    services: &Services,
    mut ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    let records = packer::collect_records(&services.store, &ctx.requested)
        .await
        .at_stage(Stage::BuildManifest)?;
    if records.is_empty() {
        return Err(PipelineError::NothingToExport);
    }

    let mut documents = Vec::with_capacity(records.len());
    for record in &records {
        let is_root = ctx.requested.contains(&record.identifier);
        let packed = packer::pack_record(record, is_root);
        documents.push(packed.document);
        ctx.artifacts.extend(packed.artifact);
        ctx.assets.extend(packed.asset);
    }

    let roots: Vec<_> = records
        .iter()
        .filter(|r| ctx.requested.contains(&r.identifier))
        .collect();
    ctx.archive_path = ctx.destination.join(packer::archive_file_name(&roots));

    ctx.manifest = Some(Manifest::for_export(documents).at_stage(Stage::BuildManifest)?);
    ctx.metadata
        .insert("content_count".to_string(), json!(records.len()));
    ctx.records = records;

    debug!(
        records = ctx.records.len(),
        artifacts = ctx.artifacts.len(),
        "Export manifest built"
    );
    Ok(ctx)
}

async fn write_manifest(
    services: &Services,
    mut ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    let document = ctx
        .manifest
        .as_ref()
        .map(Manifest::to_document)
        .unwrap_or_default();
    let bytes = serde_json::to_vec_pretty(&document).at_stage(Stage::WriteManifest)?;

    services
        .fs
        .write_file(&ctx.work_path(MANIFEST_FILE_NAME), &bytes)
        .await
        .at_stage(Stage::WriteManifest)?;
    ctx.manifest_size = bytes.len() as u64;

    Ok(ctx)
}

/// Bundle each available artifact directory as `<id>/<id>.zip`
async fn compress(
    services: &Services,
    mut ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    for artifact in &ctx.artifacts {
        let target = ctx.work_path(&artifact.archive_path);
        services
            .archiver
            .compress(&artifact.source_dir, &target)
            .await
            .at_stage(Stage::Compress)?;

        let size = services
            .fs
            .file_size(&target)
            .await
            .at_stage(Stage::Compress)?;
        ctx.artifact_sizes.insert(artifact.identifier.clone(), size);
    }

    Ok(ctx)
}

async fn verify_device_space(
    services: &Services,
    ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    let required = ctx
        .required_bytes()
        .saturating_add(services.settings.space_margin_bytes);
    let available = services
        .fs
        .available_space(ctx.destination())
        .await
        .at_stage(Stage::VerifyDeviceSpace)?;

    if available < required {
        return Err(PipelineError::InsufficientStorage {
            required,
            available,
        });
    }

    debug!(required, available, "Device space verified");
    Ok(ctx)
}

/// Copy bundled icons; missing icons are skipped
async fn copy_assets(
    services: &Services,
    ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    for asset in &ctx.assets {
        let (Some(src_dir), Some(src_name)) = (
            asset.source.parent(),
            asset.source.file_name().and_then(|n| n.to_str()),
        ) else {
            continue;
        };

        let target = ctx.work_path(&asset.archive_path);
        let (Some(dst_dir), Some(dst_name)) = (
            target.parent(),
            target.file_name().and_then(|n| n.to_str()),
        ) else {
            continue;
        };

        if let Err(e) = services
            .fs
            .copy_file(src_dir, src_name, dst_dir, dst_name)
            .await
        {
            debug!(identifier = %asset.identifier, error = %format!("{e:#}"), "Icon not bundled");
        }
    }

    Ok(ctx)
}

/// Assemble the final archive and checksum it
async fn bundle_archive(
    services: &Services,
    mut ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    services
        .fs
        .create_dir(&ctx.destination, false)
        .await
        .at_stage(Stage::BundleArchive)?;
    services
        .archiver
        .compress(&ctx.work_dir, &ctx.archive_path)
        .await
        .at_stage(Stage::BundleArchive)?;

    ctx.archive_size = services
        .fs
        .file_size(&ctx.archive_path)
        .await
        .at_stage(Stage::BundleArchive)?;
    ctx.checksum = Some(
        packer::file_checksum(&ctx.archive_path)
            .await
            .at_stage(Stage::BundleArchive)?,
    );

    Ok(ctx)
}

async fn delete_temp_archive(
    services: &Services,
    ctx: ExportContext,
) -> Result<ExportContext, PipelineError> {
    services
        .fs
        .remove_dir(&ctx.work_dir)
        .await
        .at_stage(Stage::DeleteTempArchive)?;
    Ok(ctx)
}
