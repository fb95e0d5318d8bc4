//! Version graph store: append-only DAG of versions per document.
//!
//! ```text
//!            ┌──────────── VersionGraphStore ────────────┐
//!  ops ────► │ doc "a" ─ Mutex<DocumentGraph>            │ ──► GraphEvent (broadcast)
//!            │ doc "b" ─ Mutex<DocumentGraph>            │
//!            └───────────────────┬───────────────────────┘
//!                                │ one WriteBatch per op
//!                                ▼
//!                          DurableStore
//! ```
//!
//! Every mutating operation locks its document, stages the complete set of
//! durable writes, commits them as one batch, and only then publishes the
//! change to the in-memory graph. A failed batch leaves both sides untouched.

pub mod document;
pub mod node;

pub use document::{DocumentGraph, DocumentRecord, DEFAULT_BRANCH};
pub use node::{content_hash, keys, Branch, Metadata, Tag, VersionId, VersionNode};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::patch::{self, PatchSet};
use crate::store::{DurableStore, StoreError, WriteBatch};
use crate::ErrorKind;
use document::key;

/// Lease on the durable save lock taken around [`VersionGraphStore::save`].
pub const SAVE_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Buffered graph events per subscriber.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("version not found: {0}")]
    VersionNotFound(VersionId),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("tag not found: {0}")]
    TagNotFound(String),
    #[error("document already exists: {0}")]
    DocumentExists(String),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("tag already exists: {0}")]
    TagExists(String),
    #[error("save lock for {document_id} is held by another user")]
    LockHeld { document_id: String },
    #[error("content hash mismatch for version {0}")]
    Corruption(VersionId),
    #[error("branch {source_branch} is already contained in {target}")]
    UpToDate { source_branch: String, target: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::DocumentNotFound(_)
            | GraphError::VersionNotFound(_)
            | GraphError::BranchNotFound(_)
            | GraphError::TagNotFound(_) => ErrorKind::NotFound,
            GraphError::DocumentExists(_)
            | GraphError::BranchExists(_)
            | GraphError::TagExists(_) => ErrorKind::AlreadyExists,
            GraphError::LockHeld { .. } => ErrorKind::LockHeld,
            GraphError::Corruption(_) => ErrorKind::Corruption,
            GraphError::UpToDate { .. } | GraphError::InvalidInput(_) => ErrorKind::InvalidInput,
            GraphError::Store(e) => e.kind(),
        }
    }
}

/// How `merge_branches` builds the merged content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Three-way: replay source then target hunks onto the common ancestor.
    Auto,
    /// Take the source branch content verbatim.
    Source,
    /// Take the target branch content verbatim.
    Target,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Auto => "auto",
            Resolution::Source => "source",
            Resolution::Target => "target",
        }
    }
}

/// Which branch a conflicting hunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSide {
    Source,
    Target,
}

/// A hunk that could not be replayed during an automatic merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub side: MergeSide,
    /// Position of the hunk within its side's patch set.
    pub index: usize,
    /// The hunk, in patch text form.
    pub patch: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub node: VersionNode,
    pub ancestor: VersionId,
    pub conflicts: Vec<MergeConflict>,
}

/// Notifications published after a mutation is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    DocumentInitialized { document_id: String, version_id: VersionId },
    VersionCreated { document_id: String, branch: String, version_id: VersionId },
    BranchCreated { document_id: String, branch: String, version_id: VersionId },
    BranchSwitched { document_id: String, branch: String, version_id: VersionId },
    Merged { document_id: String, source: String, target: String, version_id: VersionId, conflicts: usize },
    Restored { document_id: String, branch: String, version_id: VersionId, restored_from: VersionId },
    TagCreated { document_id: String, name: String, version_id: VersionId },
}

impl GraphEvent {
    pub fn document_id(&self) -> &str {
        match self {
            GraphEvent::DocumentInitialized { document_id, .. }
            | GraphEvent::VersionCreated { document_id, .. }
            | GraphEvent::BranchCreated { document_id, .. }
            | GraphEvent::BranchSwitched { document_id, .. }
            | GraphEvent::Merged { document_id, .. }
            | GraphEvent::Restored { document_id, .. }
            | GraphEvent::TagCreated { document_id, .. } => document_id,
        }
    }
}

type SharedGraph = Arc<Mutex<DocumentGraph>>;

/// Owner of every document's version graph, mirrored to a [`DurableStore`].
pub struct VersionGraphStore<S: DurableStore> {
    durable: Arc<S>,
    documents: RwLock<HashMap<String, SharedGraph>>,
    events: broadcast::Sender<GraphEvent>,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> GraphError {
    GraphError::Store(StoreError::Backend("graph lock poisoned".to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, GraphError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

fn from_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, GraphError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()).into())
}

fn validate_document_id(document_id: &str) -> Result<(), GraphError> {
    if document_id.is_empty() || document_id.contains('/') {
        return Err(GraphError::InvalidInput(format!(
            "document id {document_id:?} must be non-empty and contain no '/'"
        )));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str) -> Result<(), GraphError> {
    if name.trim().is_empty() {
        return Err(GraphError::InvalidInput(format!("{kind} name must not be empty")));
    }
    Ok(())
}

impl<S: DurableStore> VersionGraphStore<S> {
    pub fn new(durable: Arc<S>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            durable,
            documents: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }

    pub fn durable(&self) -> &Arc<S> {
        &self.durable
    }

    fn publish(&self, event: GraphEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ─── Loading ──────────────────────────────────────────────────────

    /// Cached graph for `document_id`, loading it from durable storage on
    /// first use.
    fn graph(&self, document_id: &str) -> Result<SharedGraph, GraphError> {
        validate_document_id(document_id)?;
        if let Some(graph) = self.documents.read().map_err(poisoned)?.get(document_id) {
            return Ok(graph.clone());
        }

        let loaded = self
            .load(document_id)?
            .ok_or_else(|| GraphError::DocumentNotFound(document_id.to_string()))?;
        let mut documents = self.documents.write().map_err(poisoned)?;
        let graph = documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)));
        Ok(graph.clone())
    }

    fn load(&self, document_id: &str) -> Result<Option<DocumentGraph>, GraphError> {
        let record: DocumentRecord = match self.durable.get(&key::document(document_id))? {
            Some(bytes) => from_json(&bytes)?,
            None => return Ok(None),
        };

        let mut nodes = HashMap::new();
        for (_, bytes) in self.durable.scan_prefix(&key::nodes(document_id))? {
            let node: VersionNode = from_json(&bytes)?;
            if !node.verify() {
                log::error!("Version {} of {document_id} failed hash verification", node.id);
            }
            nodes.insert(node.id, node);
        }
        let mut branches = BTreeMap::new();
        for (_, bytes) in self.durable.scan_prefix(&key::branches(document_id))? {
            let branch: Branch = from_json(&bytes)?;
            branches.insert(branch.name.clone(), branch);
        }
        let mut tags = BTreeMap::new();
        for (_, bytes) in self.durable.scan_prefix(&key::tags(document_id))? {
            let tag: Tag = from_json(&bytes)?;
            tags.insert(tag.name.clone(), tag);
        }

        let graph = DocumentGraph { record, nodes, branches, tags };
        graph.validate()?;
        log::info!(
            "Loaded document {document_id}: {} versions, {} branches, {} tags",
            graph.nodes.len(),
            graph.branches.len(),
            graph.tags.len()
        );
        Ok(Some(graph))
    }

    /// Run `op` with the document locked.
    fn with_graph<T>(
        &self,
        document_id: &str,
        op: impl FnOnce(&mut DocumentGraph) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let shared = self.graph(document_id)?;
        let mut graph = shared.lock().map_err(poisoned)?;
        op(&mut graph)
    }

    pub fn contains_document(&self, document_id: &str) -> Result<bool, GraphError> {
        validate_document_id(document_id)?;
        if self.documents.read().map_err(poisoned)?.contains_key(document_id) {
            return Ok(true);
        }
        Ok(self.durable.get(&key::document(document_id))?.is_some())
    }

    /// Ids of every document in durable storage.
    pub fn list_documents(&self) -> Result<Vec<String>, GraphError> {
        Ok(self
            .durable
            .scan_prefix(key::DOCUMENTS)?
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(key::DOCUMENTS).map(str::to_string))
            .collect())
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Create the document's root version and its `main` branch.
    pub fn initialize_document(
        &self,
        document_id: &str,
        initial_content: &str,
    ) -> Result<VersionNode, GraphError> {
        validate_document_id(document_id)?;
        let mut documents = self.documents.write().map_err(poisoned)?;
        if documents.contains_key(document_id)
            || self.durable.get(&key::document(document_id))?.is_some()
        {
            return Err(GraphError::DocumentExists(document_id.to_string()));
        }

        let root = VersionNode::new(initial_content.to_string(), Vec::new(), 0, Metadata::new());
        let branch = Branch::new(DEFAULT_BRANCH, root.id);
        let record = DocumentRecord {
            document_id: document_id.to_string(),
            root: root.id,
            current_branch: DEFAULT_BRANCH.to_string(),
            created_at: root.created_at,
        };

        let mut batch = WriteBatch::new();
        batch.put(key::document(document_id), to_json(&record)?);
        batch.put(key::node(document_id, root.id), to_json(&root)?);
        batch.put(key::branch(document_id, DEFAULT_BRANCH), to_json(&branch)?);
        self.durable.write_batch(batch)?;

        let mut graph = DocumentGraph {
            record,
            nodes: HashMap::new(),
            branches: BTreeMap::new(),
            tags: BTreeMap::new(),
        };
        graph.nodes.insert(root.id, root.clone());
        graph.branches.insert(DEFAULT_BRANCH.to_string(), branch);
        documents.insert(document_id.to_string(), Arc::new(Mutex::new(graph)));
        drop(documents);

        log::info!("Initialized document {document_id} at root {}", root.id);
        self.publish(GraphEvent::DocumentInitialized {
            document_id: document_id.to_string(),
            version_id: root.id,
        });
        Ok(root)
    }

    /// Append a version on top of the current branch tip.
    ///
    /// Committing the tip's own content is a no-op returning the tip, and
    /// publishes nothing.
    pub fn create_version(
        &self,
        document_id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<VersionNode, GraphError> {
        let (node, branch, moved) = self.with_graph(document_id, |graph| {
            let branch = graph.record.current_branch.clone();
            let tip = graph.tip(&branch)?;
            if tip.content_hash == content_hash(content) {
                log::debug!("Commit to {document_id}/{branch} matches tip {}, skipped", tip.id);
                return Ok((tip.clone(), branch, false));
            }
            let parents = vec![tip.id];
            let node = self.append(graph, &branch, parents, content.to_string(), metadata)?;
            Ok((node, branch, true))
        })?;

        if moved {
            self.publish(GraphEvent::VersionCreated {
                document_id: document_id.to_string(),
                branch,
                version_id: node.id,
            });
        }
        Ok(node)
    }

    /// [`create_version`](Self::create_version) under the durable save lock
    /// of `(document_id, user_id)`.
    pub fn save(
        &self,
        document_id: &str,
        user_id: &str,
        content: &str,
        mut metadata: Metadata,
    ) -> Result<VersionNode, GraphError> {
        let lock_id = format!("save/{document_id}");
        if !self.durable.acquire_lock(&lock_id, user_id, SAVE_LOCK_TTL)? {
            log::warn!("Save of {document_id} by {user_id} refused: lock held");
            return Err(GraphError::LockHeld { document_id: document_id.to_string() });
        }
        metadata
            .entry(keys::AUTHOR.to_string())
            .or_insert_with(|| user_id.to_string());
        let result = self.create_version(document_id, content, metadata);
        if let Err(e) = self.durable.release_lock(&lock_id, user_id) {
            log::error!("Failed to release save lock for {document_id}: {e}");
        }
        result
    }

    /// Stage and commit a new node plus the branch pointer move.
    fn append(
        &self,
        graph: &mut DocumentGraph,
        branch: &str,
        parents: Vec<VersionId>,
        content: String,
        metadata: Metadata,
    ) -> Result<VersionNode, GraphError> {
        let document_id = graph.document_id().to_string();
        let hash = content_hash(&content);

        let node = match graph.find_duplicate(&parents, &hash) {
            Some(existing) => {
                log::debug!("Duplicate commit on {document_id}, reusing {}", existing.id);
                existing.clone()
            }
            None => {
                let depth = graph.depth_for(&parents)?;
                VersionNode::new(content, parents, depth, metadata)
            }
        };
        let is_new = !graph.nodes.contains_key(&node.id);

        let mut batch = WriteBatch::new();
        let mut updated_parents = Vec::new();
        if is_new {
            batch.put(key::node(&document_id, node.id), to_json(&node)?);
            for parent_id in &node.parents {
                let mut parent = graph.node(*parent_id)?.clone();
                parent.child_ids.insert(node.id);
                batch.put(key::node(&document_id, parent.id), to_json(&parent)?);
                updated_parents.push(parent);
            }
        }
        let pointer = Branch::new(branch, node.id);
        batch.put(key::branch(&document_id, branch), to_json(&pointer)?);
        self.durable.write_batch(batch)?;

        for parent in updated_parents {
            graph.nodes.insert(parent.id, parent);
        }
        graph.nodes.insert(node.id, node.clone());
        graph.branches.insert(branch.to_string(), pointer);
        log::info!(
            "Document {document_id}: {branch} -> {} ({} parents)",
            node.id,
            node.parents.len()
        );
        Ok(node)
    }

    pub fn create_branch(
        &self,
        document_id: &str,
        name: &str,
        start_version_id: VersionId,
    ) -> Result<Branch, GraphError> {
        validate_name("branch", name)?;
        let branch = self.with_graph(document_id, |graph| {
            if graph.branches.contains_key(name) {
                return Err(GraphError::BranchExists(name.to_string()));
            }
            graph.node(start_version_id)?;
            let branch = Branch::new(name, start_version_id);
            self.durable
                .put(&key::branch(document_id, name), &to_json(&branch)?)?;
            graph.branches.insert(name.to_string(), branch.clone());
            Ok(branch)
        })?;

        log::info!("Document {document_id}: created branch {name} at {start_version_id}");
        self.publish(GraphEvent::BranchCreated {
            document_id: document_id.to_string(),
            branch: name.to_string(),
            version_id: start_version_id,
        });
        Ok(branch)
    }

    /// Make `name` the current branch. Content is not touched; the caller
    /// loads the returned version.
    pub fn switch_branch(&self, document_id: &str, name: &str) -> Result<VersionId, GraphError> {
        let version_id = self.with_graph(document_id, |graph| {
            let version_id = graph.branch(name)?.version_id;
            let mut record = graph.record.clone();
            record.current_branch = name.to_string();
            self.durable
                .put(&key::document(document_id), &to_json(&record)?)?;
            graph.record = record;
            Ok(version_id)
        })?;

        log::info!("Document {document_id}: switched to branch {name}");
        self.publish(GraphEvent::BranchSwitched {
            document_id: document_id.to_string(),
            branch: name.to_string(),
            version_id,
        });
        Ok(version_id)
    }

    /// Merge `source` into `target`, always producing a two-parent node on
    /// `target`. Conflicts are returned, and the target still advances.
    pub fn merge_branches(
        &self,
        document_id: &str,
        source: &str,
        target: &str,
        resolution: Resolution,
    ) -> Result<MergeOutcome, GraphError> {
        if source == target {
            return Err(GraphError::InvalidInput(format!(
                "cannot merge branch {source} into itself"
            )));
        }

        let outcome = self.with_graph(document_id, |graph| {
            let source_tip = graph.tip(source)?.clone();
            let target_tip = graph.tip(target)?.clone();
            if graph.is_ancestor(source_tip.id, target_tip.id)? {
                return Err(GraphError::UpToDate {
                    source_branch: source.to_string(),
                    target: target.to_string(),
                });
            }
            let ancestor_id = graph
                .common_ancestor(source_tip.id, target_tip.id)?
                .ok_or(GraphError::Corruption(source_tip.id))?;
            let ancestor = graph.node(ancestor_id)?;

            let (content, conflicts) = match resolution {
                Resolution::Source => (source_tip.content.clone(), Vec::new()),
                Resolution::Target => (target_tip.content.clone(), Vec::new()),
                Resolution::Auto => three_way(&ancestor.content, &source_tip.content, &target_tip.content),
            };

            let mut metadata = Metadata::new();
            metadata.insert(keys::MERGE_SOURCE.into(), source.to_string());
            metadata.insert(keys::MERGE_TARGET.into(), target.to_string());
            metadata.insert(keys::MERGE_SOURCE_VERSION.into(), source_tip.id.to_string());
            metadata.insert(keys::MERGE_TARGET_VERSION.into(), target_tip.id.to_string());
            metadata.insert(keys::MERGE_ANCESTOR.into(), ancestor_id.to_string());
            metadata.insert(keys::MERGE_RESOLUTION.into(), resolution.as_str().to_string());
            metadata.insert(keys::MERGE_CONFLICTS.into(), conflicts.len().to_string());

            let parents = vec![target_tip.id, source_tip.id];
            let node = self.append(graph, target, parents, content, metadata)?;
            Ok(MergeOutcome { node, ancestor: ancestor_id, conflicts })
        })?;

        if !outcome.conflicts.is_empty() {
            log::warn!(
                "Merge {source} -> {target} in {document_id} recorded {} conflicts",
                outcome.conflicts.len()
            );
        }
        self.publish(GraphEvent::Merged {
            document_id: document_id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            version_id: outcome.node.id,
            conflicts: outcome.conflicts.len(),
        });
        Ok(outcome)
    }

    pub fn create_tag(
        &self,
        document_id: &str,
        name: &str,
        version_id: VersionId,
        metadata: Metadata,
    ) -> Result<Tag, GraphError> {
        validate_name("tag", name)?;
        let tag = self.with_graph(document_id, |graph| {
            if graph.tags.contains_key(name) {
                return Err(GraphError::TagExists(name.to_string()));
            }
            graph.node(version_id)?;
            let tag = Tag {
                name: name.to_string(),
                version_id,
                created_at: Utc::now(),
                metadata,
            };
            self.durable.put(&key::tag(document_id, name), &to_json(&tag)?)?;
            graph.tags.insert(name.to_string(), tag.clone());
            Ok(tag)
        })?;

        self.publish(GraphEvent::TagCreated {
            document_id: document_id.to_string(),
            name: name.to_string(),
            version_id,
        });
        Ok(tag)
    }

    /// New version on the current branch carrying an old version's content.
    /// History is never rewritten.
    pub fn restore(&self, document_id: &str, version_id: VersionId) -> Result<VersionNode, GraphError> {
        let (node, branch) = self.with_graph(document_id, |graph| {
            let historical = graph.node(version_id)?;
            if !historical.verify() {
                log::error!("Refusing to restore corrupted version {version_id} of {document_id}");
                return Err(GraphError::Corruption(version_id));
            }
            let content = historical.content.clone();
            let branch = graph.record.current_branch.clone();
            let parents = vec![graph.tip(&branch)?.id];
            let mut metadata = Metadata::new();
            metadata.insert(keys::RESTORED_FROM.into(), version_id.to_string());
            let node = self.append(graph, &branch, parents, content, metadata)?;
            Ok((node, branch))
        })?;

        self.publish(GraphEvent::Restored {
            document_id: document_id.to_string(),
            branch,
            version_id: node.id,
            restored_from: version_id,
        });
        Ok(node)
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// First-parent chain from the branch tip (current branch when `None`)
    /// to the root, newest first.
    pub fn get_history(
        &self,
        document_id: &str,
        branch: Option<&str>,
    ) -> Result<Vec<VersionNode>, GraphError> {
        self.with_graph(document_id, |graph| {
            let name = branch.unwrap_or(graph.record.current_branch.as_str()).to_string();
            let tip = graph.branch(&name)?.version_id;
            Ok(graph
                .first_parent_chain(tip)?
                .into_iter()
                .cloned()
                .collect())
        })
    }

    pub fn get_diff(
        &self,
        document_id: &str,
        from: VersionId,
        to: VersionId,
    ) -> Result<PatchSet, GraphError> {
        self.with_graph(document_id, |graph| {
            let a = verified(graph.node(from)?)?;
            let b = verified(graph.node(to)?)?;
            Ok(PatchSet::between(&a.content, &b.content))
        })
    }

    /// Version with its hash checked against its content.
    pub fn get_version(&self, document_id: &str, version_id: VersionId) -> Result<VersionNode, GraphError> {
        self.with_graph(document_id, |graph| verified(graph.node(version_id)?).cloned())
    }

    pub fn get_content(&self, document_id: &str, version_id: VersionId) -> Result<String, GraphError> {
        self.get_version(document_id, version_id).map(|node| node.content)
    }

    pub fn current_branch(&self, document_id: &str) -> Result<Branch, GraphError> {
        self.with_graph(document_id, |graph| graph.current_branch().cloned())
    }

    /// Verified tip of the current branch.
    pub fn head(&self, document_id: &str) -> Result<VersionNode, GraphError> {
        self.with_graph(document_id, |graph| {
            let tip = graph.current_branch()?.version_id;
            verified(graph.node(tip)?).cloned()
        })
    }

    pub fn list_branches(&self, document_id: &str) -> Result<Vec<Branch>, GraphError> {
        self.with_graph(document_id, |graph| Ok(graph.branches.values().cloned().collect()))
    }

    pub fn list_tags(&self, document_id: &str) -> Result<Vec<Tag>, GraphError> {
        self.with_graph(document_id, |graph| Ok(graph.tags.values().cloned().collect()))
    }

    pub fn get_tag(&self, document_id: &str, name: &str) -> Result<Tag, GraphError> {
        self.with_graph(document_id, |graph| {
            graph
                .tags
                .get(name)
                .cloned()
                .ok_or_else(|| GraphError::TagNotFound(name.to_string()))
        })
    }
}

fn verified(node: &VersionNode) -> Result<&VersionNode, GraphError> {
    if node.verify() {
        Ok(node)
    } else {
        log::error!("Content hash mismatch for version {}", node.id);
        Err(GraphError::Corruption(node.id))
    }
}

/// Replay `ancestor → source` then `ancestor → target` hunks onto the
/// ancestor content, collecting the hunks that did not apply.
fn three_way(ancestor: &str, source: &str, target: &str) -> (String, Vec<MergeConflict>) {
    let source_patches = PatchSet::between(ancestor, source);
    let target_patches = PatchSet::between(ancestor, target);

    let (merged, source_flags) = patch::apply(ancestor, &source_patches);
    let (merged, target_flags) = patch::apply(&merged, &target_patches);

    let mut conflicts = Vec::new();
    for (side, patches, flags) in [
        (MergeSide::Source, &source_patches, &source_flags),
        (MergeSide::Target, &target_patches, &target_flags),
    ] {
        for (index, (hunk, applied)) in patches.iter().zip(flags.iter()).enumerate() {
            if !applied {
                conflicts.push(MergeConflict {
                    side,
                    index,
                    patch: PatchSet::new(vec![hunk.clone()]).to_text(),
                });
            }
        }
    }
    (merged, conflicts)
}
