//! Views over stored content trees.

use serde::{Deserialize, Serialize};

use super::record::ContentRecord;

/// One ancestor on the path from a root to a content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyInfo {
    pub identifier: String,
    pub content_type: String,
}

impl HierarchyInfo {
    pub fn of(record: &ContentRecord) -> Self {
        Self {
            identifier: record.identifier.clone(),
            content_type: record.content_type.clone(),
        }
    }
}

/// A stored content with the part of its subtree that was loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub record: ContentRecord,

    /// Ancestors from the root down to the direct parent (empty for the root)
    pub hierarchy: Vec<HierarchyInfo>,

    /// Children present in the library, in declared order
    pub children: Vec<ContentNode>,
}

impl ContentNode {
    pub fn identifier(&self) -> &str {
        &self.record.identifier
    }

    /// Path from the root down to and including this node
    pub fn path(&self) -> Vec<HierarchyInfo> {
        let mut path = self.hierarchy.clone();
        path.push(HierarchyInfo::of(&self.record));
        path
    }

    /// Number of nodes in this subtree, itself included
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ContentNode::node_count).sum::<usize>()
    }
}
