//! Archive packing helpers for the export pipeline.
//!
//! Turns stored records into export manifest items (with archive-relative
//! artifact and icon paths), names the archive, and checksums the result.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::domain::{ArtifactEntry, AssetEntry, ContentRecord, ContentState, Visibility};
use crate::store::ContentStore;

/// Extension of exported archives
pub const ARCHIVE_EXTENSION: &str = "ecar";

const CHECKSUM_BUFFER: usize = 64 * 1024;

/// One record prepared for the export manifest
#[derive(Debug, Clone)]
pub struct PackedItem {
    pub document: Value,
    pub artifact: Option<ArtifactEntry>,
    pub asset: Option<AssetEntry>,
}

/// Load the requested records and all their descendants
///
/// Requested records come first, descendants follow breadth-first. Unknown
/// identifiers are dropped.
pub async fn collect_records(
    store: &ContentStore,
    requested: &[String],
) -> Result<Vec<ContentRecord>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut frontier: Vec<String> = requested
        .iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect();
    let mut records = Vec::new();

    while !frontier.is_empty() {
        let found = store
            .fetch_many(&frontier)
            .await
            .context("Failed to load content records")?;

        let mut next = Vec::new();
        for id in &frontier {
            let Some(record) = found.get(id) else {
                continue;
            };
            for child in record.child_identifiers() {
                if seen.insert(child.clone()) {
                    next.push(child);
                }
            }
            records.push(record.clone());
        }
        frontier = next;
    }

    Ok(records)
}

/// Build the manifest entry for one record
///
/// Requested roots are exported with `Default` visibility. Available leaves
/// get their directory bundled as `<id>/<id>.zip`; bundled icons are moved
/// to `<id>/<file>`.
pub fn pack_record(record: &ContentRecord, is_root: bool) -> PackedItem {
    let mut document = match record.metadata() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    document.insert("identifier".to_string(), json!(record.identifier));

    if is_root {
        document.insert("visibility".to_string(), json!(Visibility::Default.as_str()));
    }

    let id = &record.identifier;
    let is_online = document
        .get("contentDisposition")
        .and_then(Value::as_str)
        .is_some_and(|d| d.eq_ignore_ascii_case("online"));

    let artifact = match &record.local_path {
        Some(dir)
            if record.state == ContentState::ArtifactAvailable
                && !record.is_collection()
                && !is_online =>
        {
            let archive_path = format!("{id}/{id}.zip");
            document.insert("artifactUrl".to_string(), json!(archive_path));
            document.insert("contentEncoding".to_string(), json!("gzip"));
            document.insert("contentDisposition".to_string(), json!("inline"));
            Some(ArtifactEntry {
                identifier: id.clone(),
                source_dir: dir.clone(),
                archive_path,
            })
        }
        _ => None,
    };

    let icon = document
        .get("appIcon")
        .and_then(Value::as_str)
        .filter(|icon| !icon.is_empty() && !icon.contains("://"))
        .map(str::to_string);
    let asset = match (icon, &record.local_path) {
        (Some(icon), Some(dir)) => {
            let relative = icon.trim_start_matches('/');
            let file_name = relative.rsplit('/').next().unwrap_or(relative);
            let archive_path = format!("{id}/{file_name}");
            let entry = AssetEntry {
                identifier: id.clone(),
                source: dir.join(relative),
                archive_path: archive_path.clone(),
            };
            document.insert("appIcon".to_string(), json!(archive_path));
            Some(entry)
        }
        _ => None,
    };

    PackedItem {
        document: Value::Object(document),
        artifact,
        asset,
    }
}

/// File name of the exported archive
///
/// `<name>-v<version>.ecar` for a single root, with a `-plus-<n>` suffix when
/// several roots are exported together.
pub fn archive_file_name(roots: &[&ContentRecord]) -> String {
    let Some(first) = roots.first() else {
        return format!("export.{ARCHIVE_EXTENSION}");
    };

    let name = first
        .metadata()
        .and_then(|doc| doc.get("name").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| first.identifier.clone());

    let mut stem = sanitize(&name);
    if let Some(version) = first.package_version {
        stem.push_str(&format!("-v{}", format_version(version)));
    }
    if roots.len() > 1 {
        stem.push_str(&format!("-plus-{}", roots.len() - 1));
    }

    format!("{stem}.{ARCHIVE_EXTENSION}")
}

fn format_version(version: f64) -> String {
    if version.fract() == 0.0 {
        format!("{}", version as i64)
    } else {
        format!("{version}")
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();

    if cleaned.is_empty() {
        "content".to_string()
    } else {
        cleaned
    }
}

/// Hex SHA-256 of a file, read in chunks
pub async fn file_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHECKSUM_BUFFER];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
