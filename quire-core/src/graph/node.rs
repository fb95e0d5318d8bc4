//! Version graph records: nodes, branches, tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Free-form annotations on versions and tags.
pub type Metadata = BTreeMap<String, String>;

/// Metadata keys written by the graph itself.
pub mod keys {
    pub const MERGE_SOURCE: &str = "merge.source";
    pub const MERGE_TARGET: &str = "merge.target";
    pub const MERGE_SOURCE_VERSION: &str = "merge.source_version";
    pub const MERGE_TARGET_VERSION: &str = "merge.target_version";
    pub const MERGE_ANCESTOR: &str = "merge.ancestor";
    pub const MERGE_RESOLUTION: &str = "merge.resolution";
    pub const MERGE_CONFLICTS: &str = "merge.conflicts";
    pub const RESTORED_FROM: &str = "restored_from";
    pub const AUTHOR: &str = "author";
}

/// Identifier of a version node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub Uuid);

impl VersionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for VersionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(VersionId)
    }
}

/// Lowercase hex SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Immutable snapshot of document content plus lineage.
///
/// Only `child_ids` grows after creation, as children are appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionNode {
    pub id: VersionId,
    pub content_hash: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Empty for a root, two entries (target, source) for a merge.
    pub parents: Vec<VersionId>,
    pub child_ids: BTreeSet<VersionId>,
    /// 0 for a root, otherwise one more than the deepest parent.
    pub depth: u64,
    pub metadata: Metadata,
}

impl VersionNode {
    pub(crate) fn new(content: String, parents: Vec<VersionId>, depth: u64, metadata: Metadata) -> Self {
        Self {
            id: VersionId::new(),
            content_hash: content_hash(&content),
            content,
            created_at: Utc::now(),
            parents,
            child_ids: BTreeSet::new(),
            depth,
            metadata,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn first_parent(&self) -> Option<VersionId> {
        self.parents.first().copied()
    }

    /// Whether the stored hash still matches the stored content.
    pub fn verify(&self) -> bool {
        content_hash(&self.content) == self.content_hash
    }
}

/// Named pointer to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub version_id: VersionId,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub(crate) fn new(name: impl Into<String>, version_id: VersionId) -> Self {
        Self { name: name.into(), version_id, updated_at: Utc::now() }
    }
}

/// Immutable named reference to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub version_id: VersionId,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash("Hello"), content_hash("Hello"));
        assert_ne!(content_hash("Hello"), content_hash("Hello World"));
    }

    #[test]
    fn test_node_verify_detects_tampering() {
        let mut node = VersionNode::new("Hello".into(), Vec::new(), 0, Metadata::new());
        assert!(node.verify());
        assert!(node.is_root());
        node.content.push('!');
        assert!(!node.verify());
    }

    #[test]
    fn test_version_id_parse_display() {
        let id = VersionId::new();
        let parsed: VersionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<VersionId>().is_err());
    }
}
