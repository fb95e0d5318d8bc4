//! Collaboration hub: live editing sessions, one per open document.
//!
//! ```text
//!              join / change / presence / comments / locks
//! client A ──┐                 │
//! client B ──┼──► CollaborationHub ── "D" ─► Mutex<Session> ─► SessionChannel ──► A, B, C
//! client C ──┘                 │                (sequencer)       (fan-out)
//!                              └──── "E" ─► Mutex<Session> ─► SessionChannel ──► …
//! ```
//!
//! Each session's `tokio::sync::Mutex` is the single sequencer for that
//! document: every content change is checked against `version`, applied,
//! counted and enqueued for broadcast while the mutex is held, so receivers
//! see changes in commit order. Different documents never contend.
//!
//! The hub does not persist anything. Hydration content comes from the
//! caller on join. Durable commits run the caller's save under the sequencer,
//! and the session remembers the versions it committed so their graph events
//! are not fed back into it.

use chrono::Utc;
use quire_core::{ErrorKind, GraphError, PatchError, PatchSet, VersionId, VersionNode};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{Outbound, SessionChannel};
use crate::presence::{color_for, LockError, Presence};
use crate::protocol::{
    ClientId, ClientInfo, Comment, DocumentSnapshot, SectionLock, ServerMessage, TextRange,
};

/// Own commits remembered per session until their graph event arrives.
const COMMIT_MEMORY: usize = 16;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages buffered per session receiver before it lags
    pub broadcast_capacity: usize,
    /// Maximum clients joined to one session
    pub max_clients_per_session: usize,
    /// Age after which section locks are swept
    pub section_lock_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_clients_per_session: 100,
            section_lock_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("no live session for document {0}")]
    SessionNotFound(String),
    #[error("client {client_id} has not joined {document_id}")]
    NotJoined { document_id: String, client_id: ClientId },
    #[error("session {document_id} is full ({limit} clients)")]
    SessionFull { document_id: String, limit: usize },
    #[error("change based on stale version, session is at {current}")]
    StaleVersion { current: u64 },
    #[error(transparent)]
    InvalidPatch(#[from] PatchError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("comment not found: {0}")]
    CommentNotFound(Uuid),
    #[error("only the author may remove comment {0}")]
    NotCommentAuthor(Uuid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::SessionNotFound(_) | HubError::CommentNotFound(_) => ErrorKind::NotFound,
            HubError::StaleVersion { .. } => ErrorKind::StaleVersion,
            HubError::Graph(e) => e.kind(),
            HubError::Lock(LockError::Held { .. }) | HubError::Lock(LockError::NotHolder { .. }) => {
                ErrorKind::LockHeld
            }
            HubError::Lock(LockError::NotLocked { .. }) => ErrorKind::NotFound,
            HubError::NotJoined { .. }
            | HubError::SessionFull { .. }
            | HubError::InvalidPatch(_)
            | HubError::NotCommentAuthor(_)
            | HubError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Session version the client must resync to, for rejections that are
    /// answered with `sync-required`.
    pub fn resync_version(&self) -> Option<u64> {
        match self {
            HubError::StaleVersion { current } => Some(*current),
            _ => None,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub clients: usize,
    pub changes_applied: u64,
    pub stale_rejections: u64,
    /// Hunks that found no match in an otherwise applied change
    pub skipped_hunks: u64,
}

/// An applied change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutcome {
    /// Session version after the change
    pub version: u64,
    /// Zero-based indices of the hunks that were skipped
    pub failed_hunks: Vec<usize>,
}

/// Result of a successful join.
pub struct Joined {
    pub snapshot: DocumentSnapshot,
    /// Session messages from the moment of the snapshot onwards.
    pub receiver: broadcast::Receiver<Arc<Outbound>>,
}

/// Authoritative state of one document session.
struct Session {
    document_id: String,
    content: String,
    version: u64,
    clients: BTreeMap<ClientId, ClientInfo>,
    comments: Vec<Comment>,
    presence: Presence,
    /// Set once the first joiner supplied the initial content.
    hydrated: bool,
    /// Set when torn down; a joiner holding a stale handle retries.
    closed: bool,
    /// Versions committed from this session, newest last.
    committed: VecDeque<VersionId>,
}

impl Session {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            content: String::new(),
            version: 0,
            clients: BTreeMap::new(),
            comments: Vec::new(),
            presence: Presence::new(),
            hydrated: false,
            closed: false,
            committed: VecDeque::new(),
        }
    }

    fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.document_id.clone(),
            content: self.content.clone(),
            version: self.version,
            comments: self.comments.clone(),
            cursors: self.presence.cursors().clone(),
            selections: self.presence.selections().clone(),
            locks: self.presence.locks(),
            clients: self.clients.values().cloned().collect(),
        }
    }

    fn require_member(&self, client_id: ClientId) -> Result<&ClientInfo, HubError> {
        self.clients.get(&client_id).ok_or_else(|| HubError::NotJoined {
            document_id: self.document_id.clone(),
            client_id,
        })
    }

    fn remember_commit(&mut self, version_id: VersionId) {
        if self.committed.contains(&version_id) {
            return;
        }
        if self.committed.len() == COMMIT_MEMORY {
            self.committed.pop_front();
        }
        self.committed.push_back(version_id);
    }

    /// Forget `version_id` if this session committed it.
    fn take_commit(&mut self, version_id: VersionId) -> bool {
        match self.committed.iter().position(|id| *id == version_id) {
            Some(index) => {
                self.committed.remove(index);
                true
            }
            None => false,
        }
    }
}

struct SessionHandle {
    state: Mutex<Session>,
    channel: SessionChannel,
}

/// Owner of every live session.
pub struct CollaborationHub {
    config: HubConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    memberships: RwLock<HashMap<ClientId, BTreeSet<String>>>,
    changes_applied: AtomicU64,
    stale_rejections: AtomicU64,
    skipped_hunks: AtomicU64,
}

impl Default for CollaborationHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl CollaborationHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            changes_applied: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
            skipped_hunks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    // ─── Session registry ─────────────────────────────────────────────

    async fn get_or_create(&self, document_id: &str) -> Arc<SessionHandle> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(document_id) {
                return handle.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(document_id) {
            return handle.clone();
        }
        let handle = Arc::new(SessionHandle {
            state: Mutex::new(Session::new(document_id)),
            channel: SessionChannel::new(self.config.broadcast_capacity),
        });
        sessions.insert(document_id.to_string(), handle.clone());
        log::info!("Session {document_id} opened");
        handle
    }

    async fn session(&self, document_id: &str) -> Result<Arc<SessionHandle>, HubError> {
        self.sessions
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| HubError::SessionNotFound(document_id.to_string()))
    }

    /// Remove a session the caller has just emptied. Must be called with the
    /// session's state locked.
    async fn close(&self, session: &mut Session) {
        session.closed = true;
        self.sessions.write().await.remove(&session.document_id);
        log::info!("Session {} closed (empty)", session.document_id);
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Join `client_id` to the document's session, creating it if needed.
    ///
    /// `seed` becomes the session content when this join creates the session;
    /// otherwise it is ignored. Joining again returns a fresh snapshot and
    /// receiver without notifying the others, which is how clients resync.
    pub async fn join(
        &self,
        document_id: &str,
        client_id: ClientId,
        username: &str,
        seed: Option<String>,
    ) -> Result<Joined, HubError> {
        if document_id.is_empty() {
            return Err(HubError::InvalidInput("document id must not be empty".into()));
        }
        let mut seed = seed;

        let joined = loop {
            let handle = self.get_or_create(document_id).await;
            let mut session = handle.state.lock().await;
            if session.closed {
                continue;
            }

            if !session.hydrated {
                session.content = seed.take().unwrap_or_default();
                session.hydrated = true;
            }

            let rejoin = session.clients.contains_key(&client_id);
            if !rejoin && session.clients.len() >= self.config.max_clients_per_session {
                let empty = session.clients.is_empty();
                if empty {
                    self.close(&mut session).await;
                }
                return Err(HubError::SessionFull {
                    document_id: document_id.to_string(),
                    limit: self.config.max_clients_per_session,
                });
            }

            if !rejoin {
                let info = ClientInfo {
                    client_id,
                    username: username.to_string(),
                    color: color_for(client_id),
                };
                session.clients.insert(client_id, info.clone());
                handle.channel.send_except(
                    client_id,
                    ServerMessage::UserJoined {
                        document_id: document_id.to_string(),
                        client_id,
                        username: info.username,
                        color: info.color,
                    },
                );
                log::info!(
                    "{username} ({client_id}) joined {document_id} at version {}",
                    session.version
                );
            } else {
                log::debug!("{client_id} resynced {document_id} at version {}", session.version);
            }

            // Subscribed under the session lock, so nothing between the
            // snapshot and the first received message is lost.
            let receiver = handle.channel.subscribe();
            break Joined { snapshot: session.snapshot(), receiver };
        };

        self.memberships
            .write()
            .await
            .entry(client_id)
            .or_default()
            .insert(document_id.to_string());
        Ok(joined)
    }

    /// Leave one document. Releases the client's presence and locks there.
    pub async fn leave(&self, document_id: &str, client_id: ClientId) -> Result<(), HubError> {
        {
            let mut memberships = self.memberships.write().await;
            if let Some(documents) = memberships.get_mut(&client_id) {
                documents.remove(document_id);
                if documents.is_empty() {
                    memberships.remove(&client_id);
                }
            }
        }
        self.remove_client(document_id, client_id).await
    }

    /// Drop the client from every session it joined.
    pub async fn disconnect(&self, client_id: ClientId) {
        let documents = self.memberships.write().await.remove(&client_id).unwrap_or_default();
        for document_id in documents {
            if let Err(e) = self.remove_client(&document_id, client_id).await {
                log::debug!("Disconnect of {client_id} from {document_id}: {e}");
            }
        }
        log::debug!("Client {client_id} disconnected");
    }

    async fn remove_client(&self, document_id: &str, client_id: ClientId) -> Result<(), HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        if session.clients.remove(&client_id).is_none() {
            return Err(HubError::NotJoined { document_id: document_id.to_string(), client_id });
        }

        for section_id in session.presence.purge(&client_id) {
            handle.channel.send_to_all(ServerMessage::SectionUnlocked {
                document_id: document_id.to_string(),
                section_id,
                client_id,
            });
        }
        handle.channel.send_to_all(ServerMessage::UserLeft {
            document_id: document_id.to_string(),
            client_id,
        });
        log::info!("{client_id} left {document_id}");

        if session.clients.is_empty() {
            self.close(&mut session).await;
        }
        Ok(())
    }

    // ─── Content ──────────────────────────────────────────────────────

    /// Apply a client's patch against `base_version`.
    ///
    /// Hunks that find no match are skipped and reported back; the rest
    /// apply and the session advances by one. Peers receive the change the
    /// session actually underwent.
    pub async fn submit_change(
        &self,
        document_id: &str,
        client_id: ClientId,
        patch_text: &str,
        base_version: u64,
    ) -> Result<ChangeOutcome, HubError> {
        let patches = PatchSet::from_text(patch_text)?;
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.require_member(client_id)?;

        if base_version != session.version {
            self.stale_rejections.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Stale change from {client_id} on {document_id}: base {base_version}, current {}",
                session.version
            );
            return Err(HubError::StaleVersion { current: session.version });
        }

        let (content, applied) = patches.apply(&session.content);
        let failed_hunks: Vec<usize> = applied
            .iter()
            .enumerate()
            .filter(|(_, ok)| !**ok)
            .map(|(index, _)| index)
            .collect();
        let patch_set = if failed_hunks.is_empty() {
            patch_text.to_string()
        } else {
            self.skipped_hunks.fetch_add(failed_hunks.len() as u64, Ordering::Relaxed);
            log::warn!(
                "{} of {} hunks from {client_id} on {document_id} did not apply",
                failed_hunks.len(),
                applied.len()
            );
            PatchSet::between(&session.content, &content).to_text()
        };

        session.content = content;
        session.version += 1;
        self.changes_applied.fetch_add(1, Ordering::Relaxed);
        handle.channel.send_except(
            client_id,
            ServerMessage::Change {
                document_id: document_id.to_string(),
                patch_set,
                version: session.version,
                client_id: Some(client_id),
            },
        );
        log::debug!("{document_id} -> version {} ({client_id})", session.version);
        Ok(ChangeOutcome { version: session.version, failed_hunks })
    }

    /// Set the session to `content`, announcing the difference to every
    /// client as a server change. Used when the document's branch head moves
    /// underneath a live session.
    pub async fn replace_content(&self, document_id: &str, content: &str) -> Result<u64, HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        self.overwrite(&handle, &mut session, content);
        Ok(session.version)
    }

    /// [`replace_content`](Self::replace_content) followed by `announce`,
    /// both under the sequencer.
    pub async fn replace_and_announce(
        &self,
        document_id: &str,
        content: &str,
        announce: ServerMessage,
    ) -> Result<u64, HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        self.overwrite(&handle, &mut session, content);
        handle.channel.send_to_all(announce);
        Ok(session.version)
    }

    /// Follow a branch head `version_id` that moved in the graph.
    ///
    /// A head this session committed itself is skipped: the session already
    /// holds that content or newer edits on top of it. Returns the session
    /// version, or `None` when skipped.
    pub async fn follow_head(
        &self,
        document_id: &str,
        version_id: VersionId,
        content: &str,
        announce: ServerMessage,
    ) -> Result<Option<u64>, HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        if session.take_commit(version_id) {
            log::debug!("{document_id}: head {version_id} was committed here, not replayed");
            return Ok(None);
        }
        self.overwrite(&handle, &mut session, content);
        handle.channel.send_to_all(announce);
        Ok(Some(session.version))
    }

    /// Persist the session content through `save` while holding the
    /// sequencer, so no change lands between reading and writing it.
    ///
    /// `save` returns the stored node and its branch. Every client is told
    /// `committed`. Returns the node with the session version it captured.
    pub async fn commit<F>(
        &self,
        document_id: &str,
        client_id: ClientId,
        save: F,
    ) -> Result<(VersionNode, u64), HubError>
    where
        F: FnOnce(&str) -> Result<(VersionNode, String), GraphError>,
    {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.require_member(client_id)?;

        let (node, branch) = save(&session.content)?;
        session.remember_commit(node.id);
        handle.channel.send_to_all(ServerMessage::Committed {
            document_id: document_id.to_string(),
            version_id: node.id,
            content_hash: node.content_hash.clone(),
            branch,
        });
        log::info!("{document_id} version {} committed as {}", session.version, node.id);
        Ok((node, session.version))
    }

    /// Overwrite the content of a locked session. Returns false when it was
    /// already `content`.
    fn overwrite(&self, handle: &SessionHandle, session: &mut Session, content: &str) -> bool {
        if session.content == content {
            return false;
        }
        let patch_set = PatchSet::between(&session.content, content).to_text();
        session.content = content.to_string();
        session.version += 1;
        self.changes_applied.fetch_add(1, Ordering::Relaxed);
        handle.channel.send_to_all(ServerMessage::Change {
            document_id: session.document_id.clone(),
            patch_set,
            version: session.version,
            client_id: None,
        });
        log::info!("{} replaced by server at version {}", session.document_id, session.version);
        true
    }

    pub async fn snapshot(&self, document_id: &str) -> Result<DocumentSnapshot, HubError> {
        let handle = self.session(document_id).await?;
        let session = handle.state.lock().await;
        Ok(session.snapshot())
    }

    /// Current `(content, version)` of the session.
    pub async fn content(&self, document_id: &str) -> Result<(String, u64), HubError> {
        let handle = self.session(document_id).await?;
        let session = handle.state.lock().await;
        Ok((session.content.clone(), session.version))
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub async fn update_cursor(
        &self,
        document_id: &str,
        client_id: ClientId,
        position: usize,
    ) -> Result<(), HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.require_member(client_id)?;
        session.presence.set_cursor(client_id, position);
        handle.channel.send_except(
            client_id,
            ServerMessage::Cursor { document_id: document_id.to_string(), client_id, position },
        );
        log::trace!("Cursor of {client_id} in {document_id} at {position}");
        Ok(())
    }

    pub async fn update_selection(
        &self,
        document_id: &str,
        client_id: ClientId,
        range: Option<TextRange>,
    ) -> Result<(), HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.require_member(client_id)?;
        session.presence.set_selection(client_id, range);
        handle.channel.send_except(
            client_id,
            ServerMessage::Selection { document_id: document_id.to_string(), client_id, range },
        );
        log::trace!("Selection of {client_id} in {document_id}: {range:?}");
        Ok(())
    }

    // ─── Comments ─────────────────────────────────────────────────────

    pub async fn add_comment(
        &self,
        document_id: &str,
        client_id: ClientId,
        text: &str,
        anchor: Option<TextRange>,
    ) -> Result<Comment, HubError> {
        if text.trim().is_empty() {
            return Err(HubError::InvalidInput("comment text must not be empty".into()));
        }
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        let author = session.require_member(client_id)?.username.clone();

        let comment = Comment {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            client_id,
            author,
            text: text.to_string(),
            anchor,
            created_at: Utc::now(),
        };
        session.comments.push(comment.clone());
        handle.channel.send_to_all(ServerMessage::Comment {
            document_id: document_id.to_string(),
            comment: comment.clone(),
        });
        log::debug!("Comment {} added to {document_id}", comment.id);
        Ok(comment)
    }

    /// Remove a comment. Only its author may do so.
    pub async fn remove_comment(
        &self,
        document_id: &str,
        client_id: ClientId,
        comment_id: Uuid,
    ) -> Result<(), HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.require_member(client_id)?;

        let index = session
            .comments
            .iter()
            .position(|c| c.id == comment_id)
            .ok_or(HubError::CommentNotFound(comment_id))?;
        if session.comments[index].client_id != client_id {
            return Err(HubError::NotCommentAuthor(comment_id));
        }
        session.comments.remove(index);
        handle.channel.send_to_all(ServerMessage::CommentRemoved {
            document_id: document_id.to_string(),
            comment_id,
        });
        Ok(())
    }

    // ─── Section locks ────────────────────────────────────────────────

    pub async fn lock_section(
        &self,
        document_id: &str,
        section_id: &str,
        client_id: ClientId,
    ) -> Result<SectionLock, HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.require_member(client_id)?;

        if session.presence.lock(section_id, client_id)? {
            handle.channel.send_to_all(ServerMessage::SectionLocked {
                document_id: document_id.to_string(),
                section_id: section_id.to_string(),
                client_id,
            });
            log::debug!("Section {section_id} of {document_id} locked by {client_id}");
        }
        session
            .presence
            .locks()
            .into_iter()
            .find(|lock| lock.section_id == section_id)
            .ok_or_else(|| HubError::InvalidInput(format!("lock on {section_id} vanished")))
    }

    pub async fn unlock_section(
        &self,
        document_id: &str,
        section_id: &str,
        client_id: ClientId,
    ) -> Result<(), HubError> {
        let handle = self.session(document_id).await?;
        let mut session = handle.state.lock().await;
        session.presence.unlock(section_id, client_id)?;
        handle.channel.send_to_all(ServerMessage::SectionUnlocked {
            document_id: document_id.to_string(),
            section_id: section_id.to_string(),
            client_id,
        });
        log::debug!("Section {section_id} of {document_id} unlocked by {client_id}");
        Ok(())
    }

    /// Release section locks held for at least `ttl` in every session.
    /// Returns how many were released.
    pub async fn expire_stale_locks(&self, ttl: Duration) -> usize {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        let mut released = 0;
        for handle in handles {
            let mut session = handle.state.lock().await;
            for (section_id, client_id) in session.presence.expire(ttl) {
                log::info!(
                    "Section {section_id} of {} expired (held by {client_id})",
                    session.document_id
                );
                handle.channel.send_to_all(ServerMessage::SectionUnlocked {
                    document_id: session.document_id.clone(),
                    section_id,
                    client_id,
                });
                released += 1;
            }
        }
        released
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn has_session(&self, document_id: &str) -> bool {
        self.sessions.read().await.contains_key(document_id)
    }

    /// Documents `client_id` has joined.
    pub async fn documents_of(&self, client_id: ClientId) -> Vec<String> {
        self.memberships
            .read()
            .await
            .get(&client_id)
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record messages skipped by a lagging receiver of `document_id`.
    pub async fn record_lag(&self, document_id: &str, skipped: u64) {
        if let Ok(handle) = self.session(document_id).await {
            handle.channel.record_lag(skipped);
        }
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.read().await.len(),
            clients: self.memberships.read().await.len(),
            changes_applied: self.changes_applied.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            skipped_hunks: self.skipped_hunks.load(Ordering::Relaxed),
        }
    }
}
