//! Content deletion.
//!
//! Each request runs as its own task; all tasks are joined before the
//! responses are returned, in request order, even when one of them fails. A content still referenced
//! elsewhere is only released (reference count decremented). A content that
//! is removed releases or removes its descendants as well. Row changes for
//! one request commit in one transaction; directories are deleted after the
//! commit.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    ContentEventKind, ContentRecord, DeleteRequest, DeleteResponse, DeleteStatus, Visibility,
};
use crate::store::ContentBatch;

use super::orchestrator::Services;

/// Delete every requested content and wait for all of them
pub async fn run(services: Arc<Services>, requests: Vec<DeleteRequest>) -> Result<Vec<DeleteResponse>> {
    let total = requests.len();
    let operation_id = Uuid::new_v4();
    let mut tasks = JoinSet::new();

    for (index, request) in requests.into_iter().enumerate() {
        let services = Arc::clone(&services);
        tasks.spawn(async move { (index, delete_one(&services, operation_id, request).await) });
    }

    let mut responses = Vec::with_capacity(total);
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("Delete task panicked") {
            Ok((index, Ok(response))) => responses.push((index, response)),
            Ok((_, Err(e))) | Err(e) => {
                warn!(error = %format!("{e:#}"), "Delete request failed");
                failure.get_or_insert(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    responses.sort_by_key(|(index, _)| *index);

    Ok(responses.into_iter().map(|(_, response)| response).collect())
}

#[instrument(skip_all, fields(identifier = %request.identifier))]
async fn delete_one(
    services: &Services,
    operation_id: Uuid,
    request: DeleteRequest,
) -> Result<DeleteResponse> {
    let mut plan = DeletePlan::default();

    let status = {
        let _batch_guard = services.store.lock_batch().await;

        let Some(record) = services.store.get(&request.identifier).await? else {
            debug!("Nothing to delete");
            return Ok(DeleteResponse {
                identifier: request.identifier,
                status: DeleteStatus::NotFound,
            });
        };
        plan.visited.insert(record.identifier.clone());

        let status = if record.reference_count > 1 {
            plan.release(record, !request.is_child_content);
            DeleteStatus::Released
        } else {
            plan.cascade(services, &record.child_identifiers()).await?;
            plan.remove(record);
            DeleteStatus::Deleted
        };

        services
            .store
            .apply_batch(&plan.batch)
            .await
            .with_context(|| format!("Failed to delete {}", request.identifier))?;
        status
    };

    for dir in &plan.directories {
        if let Err(e) = services.fs.remove_dir(dir).await {
            warn!(path = %dir.display(), error = %format!("{e:#}"), "Failed to remove content directory");
        }
    }

    info!(?status, removed = plan.batch.removals.len(), released = plan.batch.updates.len(), "Content deleted");
    services.events.publish(
        operation_id,
        ContentEventKind::ContentDeleted {
            identifier: request.identifier.clone(),
        },
    );

    Ok(DeleteResponse {
        identifier: request.identifier,
        status,
    })
}

/// Row changes and directories collected for one request
#[derive(Default)]
struct DeletePlan {
    batch: ContentBatch,
    directories: Vec<PathBuf>,
    visited: HashSet<String>,
}

impl DeletePlan {
    /// Decrement the reference count; a released root stops being a root
    fn release(&mut self, mut record: ContentRecord, demote_root: bool) {
        self.visited.insert(record.identifier.clone());
        record.reference_count -= 1;
        if demote_root && record.visibility == Visibility::Default {
            record.visibility = Visibility::Visible;
        }
        self.batch.updates.push(record);
    }

    fn remove(&mut self, record: ContentRecord) {
        self.visited.insert(record.identifier.clone());
        if let Some(dir) = record.local_path {
            self.directories.push(dir);
        }
        self.batch.removals.push(record.identifier);
    }

    /// Release or remove every descendant, depth first
    async fn cascade(&mut self, services: &Services, children: &[String]) -> Result<()> {
        let mut pending: Vec<String> = children.iter().rev().cloned().collect();

        while let Some(id) = pending.pop() {
            if !self.visited.insert(id.clone()) {
                continue;
            }
            let Some(child) = services.store.get(&id).await? else {
                continue;
            };

            if child.reference_count > 1 {
                self.release(child, false);
            } else {
                pending.extend(child.child_identifiers().into_iter().rev());
                self.remove(child);
            }
        }

        Ok(())
    }
}
