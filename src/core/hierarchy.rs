//! Navigation over stored content trees.
//!
//! Children come from each record's stored item document (`children` and
//! `childNodes`); children missing from the library are left out. A tree is
//! loaded one level per query.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::{ContentNode, ContentRecord, HierarchyInfo};
use crate::store::{ContentStore, StoreError};

/// Load a content and its descendants
///
/// `depth` limits how many levels below the content are loaded: `Some(0)` is
/// the content alone, `None` the whole tree.
pub async fn child_contents(
    store: &ContentStore,
    identifier: &str,
    depth: Option<usize>,
) -> Result<Option<ContentNode>, StoreError> {
    let Some(root) = store.get(identifier).await? else {
        return Ok(None);
    };

    let mut records: HashMap<String, ContentRecord> = HashMap::new();
    let mut frontier = root.child_identifiers();
    records.insert(root.identifier.clone(), root.clone());

    let mut level = 1;
    while depth.map_or(true, |max| level <= max) {
        frontier.retain(|id| !records.contains_key(id));
        frontier.sort();
        frontier.dedup();
        if frontier.is_empty() {
            break;
        }

        let fetched = store.fetch_many(&frontier).await?;
        frontier = fetched
            .values()
            .flat_map(ContentRecord::child_identifiers)
            .collect();
        records.extend(fetched);
        level += 1;
    }

    Ok(Some(build_node(&root, Vec::new(), depth, &records)))
}

/// Leaf that follows `current` in reading order of the tree rooted at
/// `hierarchy[0]`
///
/// `hierarchy` is the path from the root down to `current`'s parent.
pub async fn next_content(
    store: &ContentStore,
    hierarchy: &[HierarchyInfo],
    current: &str,
) -> Result<Option<ContentNode>, StoreError> {
    neighbour(store, hierarchy, current, Step::Next).await
}

/// Leaf that precedes `current` in reading order
pub async fn previous_content(
    store: &ContentStore,
    hierarchy: &[HierarchyInfo],
    current: &str,
) -> Result<Option<ContentNode>, StoreError> {
    neighbour(store, hierarchy, current, Step::Previous).await
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Next,
    Previous,
}

async fn neighbour(
    store: &ContentStore,
    hierarchy: &[HierarchyInfo],
    current: &str,
    step: Step,
) -> Result<Option<ContentNode>, StoreError> {
    let Some(root) = hierarchy.first() else {
        return Ok(None);
    };
    let Some(tree) = child_contents(store, &root.identifier, None).await? else {
        return Ok(None);
    };

    let leaves = reading_order(tree);
    let on_path = |leaf: &ContentNode| {
        leaf.identifier() == current
            && leaf
                .hierarchy
                .iter()
                .map(|a| &a.identifier)
                .eq(hierarchy.iter().map(|a| &a.identifier))
    };
    // The same content can sit under several units; prefer the given path
    let position = leaves
        .iter()
        .position(on_path)
        .or_else(|| leaves.iter().position(|leaf| leaf.identifier() == current));

    let Some(position) = position else {
        debug!(root = %root.identifier, current, "Content not found in tree");
        return Ok(None);
    };

    let target = match step {
        Step::Next => position.checked_add(1),
        Step::Previous => position.checked_sub(1),
    };
    Ok(target.and_then(|index| leaves.into_iter().nth(index)))
}

/// Non-collection nodes in depth-first order, each without its children
fn reading_order(tree: ContentNode) -> Vec<ContentNode> {
    let mut leaves = Vec::new();
    let mut pending = vec![tree];

    while let Some(mut node) = pending.pop() {
        let children = std::mem::take(&mut node.children);
        pending.extend(children.into_iter().rev());
        if !node.record.is_collection() {
            leaves.push(node);
        }
    }

    leaves
}

fn build_node(
    record: &ContentRecord,
    hierarchy: Vec<HierarchyInfo>,
    remaining: Option<usize>,
    records: &HashMap<String, ContentRecord>,
) -> ContentNode {
    let mut node = ContentNode {
        record: record.clone(),
        hierarchy,
        children: Vec::new(),
    };
    if remaining == Some(0) {
        return node;
    }

    let path = node.path();
    for child_id in record.child_identifiers() {
        if path.iter().any(|ancestor| ancestor.identifier == child_id) {
            continue;
        }
        if let Some(child) = records.get(&child_id) {
            node.children.push(build_node(
                child,
                path.clone(),
                remaining.map(|levels| levels - 1),
                records,
            ));
        }
    }

    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::domain::{ContentState, Visibility, COLLECTION_MIME_TYPE};
    use crate::store::ContentBatch;

    fn record(identifier: &str, children: &[&str]) -> ContentRecord {
        let mime_type = if children.is_empty() {
            "application/pdf"
        } else {
            COLLECTION_MIME_TYPE
        };
        ContentRecord {
            identifier: identifier.to_string(),
            local_path: None,
            reference_count: 1,
            state: ContentState::ArtifactAvailable,
            visibility: Visibility::Visible,
            mime_type: mime_type.to_string(),
            content_type: if children.is_empty() { "resource" } else { "textbookunit" }.to_string(),
            manifest_version: "1.1".to_string(),
            package_version: Some(1.0),
            size_on_device: 0,
            audience: "Learner".to_string(),
            pragma: String::new(),
            board: String::new(),
            medium: String::new(),
            grade: String::new(),
            raw_metadata: json!({ "identifier": identifier, "childNodes": children }).to_string(),
            last_updated_at: Utc::now(),
        }
    }

    /// do_book
    /// ├── do_u1: do_a, do_b
    /// ├── do_u2: do_c, do_gone (never imported)
    /// └── do_d
    async fn textbook() -> ContentStore {
        let store = ContentStore::open_in_memory().unwrap();
        store
            .apply_batch(&ContentBatch {
                inserts: vec![
                    record("do_book", &["do_u1", "do_u2", "do_d"]),
                    record("do_u1", &["do_a", "do_b"]),
                    record("do_u2", &["do_c", "do_gone"]),
                    record("do_a", &[]),
                    record("do_b", &[]),
                    record("do_c", &[]),
                    record("do_d", &[]),
                ],
                ..Default::default()
            })
            .await
            .unwrap();
        store
    }

    fn ids(nodes: &[ContentNode]) -> Vec<&str> {
        nodes.iter().map(ContentNode::identifier).collect()
    }

    fn path(ids: &[&str]) -> Vec<HierarchyInfo> {
        ids.iter()
            .map(|id| HierarchyInfo {
                identifier: id.to_string(),
                content_type: String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_whole_tree() {
        let store = textbook().await;
        let tree = child_contents(&store, "do_book", None).await.unwrap().unwrap();

        assert_eq!(tree.node_count(), 7);
        assert_eq!(ids(&tree.children), vec!["do_u1", "do_u2", "do_d"]);
        assert_eq!(ids(&tree.children[1].children), vec!["do_c"]);

        let leaf = &tree.children[0].children[1];
        assert_eq!(leaf.identifier(), "do_b");
        let ancestors: Vec<_> = leaf.hierarchy.iter().map(|a| a.identifier.as_str()).collect();
        assert_eq!(ancestors, vec!["do_book", "do_u1"]);
        assert_eq!(leaf.hierarchy[1].content_type, "textbookunit");
    }

    #[tokio::test]
    async fn test_depth_limits_levels() {
        let store = textbook().await;

        let alone = child_contents(&store, "do_book", Some(0)).await.unwrap().unwrap();
        assert!(alone.children.is_empty());

        let one_level = child_contents(&store, "do_book", Some(1)).await.unwrap().unwrap();
        assert_eq!(one_level.node_count(), 4);
        assert!(one_level.children.iter().all(|c| c.children.is_empty()));

        assert!(child_contents(&store, "do_missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycles_are_cut() {
        let store = ContentStore::open_in_memory().unwrap();
        store
            .apply_batch(&ContentBatch {
                inserts: vec![record("do_x", &["do_y"]), record("do_y", &["do_x"])],
                ..Default::default()
            })
            .await
            .unwrap();

        let tree = child_contents(&store, "do_x", None).await.unwrap().unwrap();
        assert_eq!(tree.node_count(), 2);
    }

    #[tokio::test]
    async fn test_next_and_previous_follow_reading_order() {
        let store = textbook().await;
        let in_u1 = path(&["do_book", "do_u1"]);

        let next = next_content(&store, &in_u1, "do_b").await.unwrap().unwrap();
        assert_eq!(next.identifier(), "do_c");
        assert_eq!(
            next.hierarchy.iter().map(|a| a.identifier.as_str()).collect::<Vec<_>>(),
            vec!["do_book", "do_u2"]
        );

        let previous = previous_content(&store, &in_u1, "do_b").await.unwrap().unwrap();
        assert_eq!(previous.identifier(), "do_a");

        let last = next_content(&store, &path(&["do_book"]), "do_d").await.unwrap();
        assert!(last.is_none());
        let first = previous_content(&store, &in_u1, "do_a").await.unwrap();
        assert!(first.is_none());
        assert!(next_content(&store, &[], "do_a").await.unwrap().is_none());
    }
}
