//! In-memory graph of one document and its traversals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::node::{Branch, Tag, VersionId, VersionNode};
use super::GraphError;

/// Name of the branch created with every document.
pub const DEFAULT_BRANCH: &str = "main";

/// Document-level record persisted under `doc/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub root: VersionId,
    pub current_branch: String,
    pub created_at: DateTime<Utc>,
}

/// Durable key layout.
pub(crate) mod key {
    use super::VersionId;

    pub fn document(doc: &str) -> String {
        format!("doc/{doc}")
    }

    pub fn node(doc: &str, id: VersionId) -> String {
        format!("node/{doc}/{id}")
    }

    pub fn nodes(doc: &str) -> String {
        format!("node/{doc}/")
    }

    pub fn branch(doc: &str, name: &str) -> String {
        format!("branch/{doc}/{name}")
    }

    pub fn branches(doc: &str) -> String {
        format!("branch/{doc}/")
    }

    pub fn tag(doc: &str, name: &str) -> String {
        format!("tag/{doc}/{name}")
    }

    pub fn tags(doc: &str) -> String {
        format!("tag/{doc}/")
    }

    pub const DOCUMENTS: &str = "doc/";
}

/// Nodes, branch pointers and tags of a single document.
#[derive(Debug, Clone)]
pub struct DocumentGraph {
    pub record: DocumentRecord,
    pub nodes: HashMap<VersionId, VersionNode>,
    pub branches: BTreeMap<String, Branch>,
    pub tags: BTreeMap<String, Tag>,
}

impl DocumentGraph {
    pub fn document_id(&self) -> &str {
        &self.record.document_id
    }

    pub fn node(&self, id: VersionId) -> Result<&VersionNode, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::VersionNotFound(id))
    }

    pub fn branch(&self, name: &str) -> Result<&Branch, GraphError> {
        self.branches
            .get(name)
            .ok_or_else(|| GraphError::BranchNotFound(name.to_string()))
    }

    pub fn current_branch(&self) -> Result<&Branch, GraphError> {
        self.branch(&self.record.current_branch)
    }

    pub fn tip(&self, branch: &str) -> Result<&VersionNode, GraphError> {
        let branch = self.branch(branch)?;
        self.node(branch.version_id)
    }

    /// First-parent chain from `start` to its root, newest first.
    pub fn first_parent_chain(&self, start: VersionId) -> Result<Vec<&VersionNode>, GraphError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                log::error!("Cycle through {id} in document {}", self.document_id());
                return Err(GraphError::Corruption(id));
            }
            let node = self.node(id)?;
            chain.push(node);
            cursor = node.first_parent();
        }
        Ok(chain)
    }

    /// Every node reachable from `start` through any parent link, `start`
    /// included.
    pub fn ancestors(&self, start: VersionId) -> Result<HashSet<VersionId>, GraphError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            queue.extend(self.node(id)?.parents.iter().copied());
        }
        Ok(seen)
    }

    /// Deepest node reachable from both `a` and `b`.
    ///
    /// Ties on depth (criss-cross histories) go to the newest node, then the
    /// greatest id, so the choice is deterministic.
    pub fn common_ancestor(&self, a: VersionId, b: VersionId) -> Result<Option<VersionId>, GraphError> {
        let from_a = self.ancestors(a)?;
        let from_b = self.ancestors(b)?;
        let best = from_a
            .intersection(&from_b)
            .filter_map(|id| self.nodes.get(id))
            .max_by(|x, y| {
                x.depth
                    .cmp(&y.depth)
                    .then(x.created_at.cmp(&y.created_at))
                    .then(x.id.cmp(&y.id))
            })
            .map(|n| n.id);
        Ok(best)
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(&self, ancestor: VersionId, descendant: VersionId) -> Result<bool, GraphError> {
        Ok(self.ancestors(descendant)?.contains(&ancestor))
    }

    /// Existing child of `parents[0]` with the same parent list and hash.
    pub fn find_duplicate(&self, parents: &[VersionId], hash: &str) -> Option<&VersionNode> {
        let first = self.nodes.get(parents.first()?)?;
        first
            .child_ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|child| child.parents == parents && child.content_hash == hash)
    }

    /// Depth a new node with these parents would get.
    pub fn depth_for(&self, parents: &[VersionId]) -> Result<u64, GraphError> {
        let mut depth = 0;
        for id in parents {
            depth = depth.max(self.node(*id)?.depth + 1);
        }
        Ok(depth)
    }

    /// Check the structural invariants: bidirectional parent/child links,
    /// branch and tag targets exist, and every node reaches the root.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            for parent in &node.parents {
                let parent_node = self.node(*parent)?;
                if !parent_node.child_ids.contains(&node.id) {
                    return Err(GraphError::Corruption(node.id));
                }
            }
            for child in &node.child_ids {
                if !self.node(*child)?.parents.contains(&node.id) {
                    return Err(GraphError::Corruption(node.id));
                }
            }
            if !self.ancestors(node.id)?.contains(&self.record.root) {
                return Err(GraphError::Corruption(node.id));
            }
        }
        for branch in self.branches.values() {
            self.node(branch.version_id)?;
        }
        for tag in self.tags.values() {
            self.node(tag.version_id)?;
        }
        Ok(())
    }
}
