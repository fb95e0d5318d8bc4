//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - A local replica per joined document, kept at the session version
//! - Edits sent as patch sets computed against the local replica
//! - Presence, comments, section locks and graph commands
//!
//! A change the replica cannot follow (a version gap, a hunk that does not
//! apply, a `sync-required` or `hunks-failed` reply) makes the client rejoin
//! the document; the server answers with a fresh snapshot.

use futures_util::{SinkExt, StreamExt};
use quire_core::{Metadata, PatchSet, VersionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientId, ClientMessage, ProtocolError, ServerMessage, TextRange};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Any frame from the server, after the local replica absorbed it
    Message(ServerMessage),
}

/// Local copy of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    pub content: String,
    pub version: u64,
}

type Replicas = Arc<Mutex<HashMap<String, LocalDocument>>>;

/// Fold a server frame into the replicas. Returns the document to resync,
/// if the frame showed the replica has diverged.
fn integrate(replicas: &mut HashMap<String, LocalDocument>, message: &ServerMessage) -> Option<String> {
    match message {
        ServerMessage::Document(snapshot) => {
            replicas.insert(
                snapshot.document_id.clone(),
                LocalDocument { content: snapshot.content.clone(), version: snapshot.version },
            );
            None
        }
        ServerMessage::Change { document_id, patch_set, version, .. } => {
            let local = replicas.get_mut(document_id)?;
            if *version <= local.version {
                // Already covered by our own edit or a newer snapshot.
                return None;
            }
            if *version != local.version + 1 {
                log::debug!("{document_id}: gap from {} to {version}, resyncing", local.version);
                return Some(document_id.clone());
            }
            let applied = PatchSet::from_text(patch_set).map(|patches| patches.apply(&local.content));
            match applied {
                Ok((content, flags)) if flags.iter().all(|ok| *ok) => {
                    local.content = content;
                    local.version = *version;
                    None
                }
                _ => {
                    log::debug!("{document_id}: change {version} did not apply, resyncing");
                    Some(document_id.clone())
                }
            }
        }
        ServerMessage::SyncRequired { document_id, .. }
        | ServerMessage::HunksFailed { document_id, .. } => {
            replicas.contains_key(document_id).then(|| document_id.clone())
        }
        _ => None,
    }
}

/// The collaboration client.
pub struct SyncClient {
    username: String,
    server_url: String,
    client_id: Arc<RwLock<Option<ClientId>>>,
    state: Arc<RwLock<ConnectionState>>,
    replicas: Replicas,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(username: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            username: username.into(),
            server_url: server_url.into(),
            client_id: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replicas: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: keep replicas current and surface every frame
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        let replicas = self.replicas.clone();
        let username = self.username.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let message = match ServerMessage::decode(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropping undecodable frame: {e}");
                        continue;
                    }
                };

                if let ServerMessage::Welcome { client_id: id } = &message {
                    *client_id.write().await = Some(*id);
                }
                let resync = integrate(&mut *replicas.lock().await, &message);
                if let Some(document_id) = resync {
                    let join = ClientMessage::Join { document_id, username: username.clone() };
                    if let Ok(encoded) = join.encode() {
                        let _ = out_tx.send(encoded).await;
                    }
                }
                let _ = event_tx.send(SyncEvent::Message(message)).await;
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::NotConnected)?;
        tx.send(message.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Open a document; the replica appears once the snapshot arrives.
    pub async fn join(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Join {
            document_id: document_id.to_string(),
            username: self.username.clone(),
        })
        .await
    }

    pub async fn leave(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.replicas.lock().await.remove(document_id);
        self.send(ClientMessage::Leave { document_id: document_id.to_string() }).await
    }

    /// Replace the replica's content and send the difference.
    ///
    /// The replica moves to the next version at once; if the server rejects
    /// the change, the resync snapshot overwrites it.
    pub async fn edit(&self, document_id: &str, new_content: &str) -> Result<(), ProtocolError> {
        let message = {
            let mut replicas = self.replicas.lock().await;
            let local = replicas
                .get_mut(document_id)
                .ok_or_else(|| ProtocolError::NotJoined(document_id.to_string()))?;
            let patches = PatchSet::between(&local.content, new_content);
            if patches.is_empty() {
                return Ok(());
            }
            let message = ClientMessage::Change {
                document_id: document_id.to_string(),
                patch_set: patches.to_text(),
                version: local.version,
            };
            local.content = new_content.to_string();
            local.version += 1;
            message
        };
        self.send(message).await
    }

    /// Replica content and version.
    pub async fn content(&self, document_id: &str) -> Option<(String, u64)> {
        self.replicas
            .lock()
            .await
            .get(document_id)
            .map(|doc| (doc.content.clone(), doc.version))
    }

    // ─── Presence and annotations ─────────────────────────────────────

    pub async fn cursor(&self, document_id: &str, position: usize) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Cursor { document_id: document_id.to_string(), position }).await
    }

    pub async fn selection(&self, document_id: &str, range: Option<TextRange>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Selection { document_id: document_id.to_string(), range }).await
    }

    pub async fn comment(
        &self,
        document_id: &str,
        text: &str,
        anchor: Option<TextRange>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Comment {
            document_id: document_id.to_string(),
            text: text.to_string(),
            anchor,
        })
        .await
    }

    pub async fn remove_comment(&self, document_id: &str, comment_id: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientMessage::CommentRemoved { document_id: document_id.to_string(), comment_id })
            .await
    }

    pub async fn lock_section(&self, document_id: &str, section_id: &str) -> Result<(), ProtocolError> {
        self.send(ClientMessage::LockSection {
            document_id: document_id.to_string(),
            section_id: section_id.to_string(),
        })
        .await
    }

    pub async fn unlock_section(&self, document_id: &str, section_id: &str) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UnlockSection {
            document_id: document_id.to_string(),
            section_id: section_id.to_string(),
        })
        .await
    }

    // ─── Version graph ────────────────────────────────────────────────

    /// Persist the session content as a new version.
    pub async fn commit(&self, document_id: &str, metadata: Metadata) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Commit { document_id: document_id.to_string(), metadata }).await
    }

    pub async fn switch_branch(&self, document_id: &str, branch: &str) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SwitchBranch {
            document_id: document_id.to_string(),
            branch: branch.to_string(),
        })
        .await
    }

    pub async fn restore(&self, document_id: &str, version_id: VersionId) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Restore { document_id: document_id.to_string(), version_id }).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    // ─── Connection ───────────────────────────────────────────────────

    /// Close the socket once queued frames are written.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Id assigned by the server, once the welcome frame arrived.
    pub async fn client_id(&self) -> Option<ClientId> {
        *self.client_id.read().await
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DocumentSnapshot;
    use std::collections::BTreeMap;

    fn snapshot(content: &str, version: u64) -> ServerMessage {
        ServerMessage::Document(DocumentSnapshot {
            document_id: "D".into(),
            content: content.into(),
            version,
            comments: Vec::new(),
            cursors: BTreeMap::new(),
            selections: BTreeMap::new(),
            locks: Vec::new(),
            clients: Vec::new(),
        })
    }

    fn change(from: &str, to: &str, version: u64) -> ServerMessage {
        ServerMessage::Change {
            document_id: "D".into(),
            patch_set: PatchSet::between(from, to).to_text(),
            version,
            client_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("alice", "ws://localhost:9090");
        assert_eq!(client.username(), "alice");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("alice", "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.client_id().await, None);
        assert_eq!(client.content("D").await, None);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new("alice", "ws://localhost:9090");
        assert_eq!(client.ping().await, Err(ProtocolError::NotConnected));
        assert_eq!(
            client.edit("D", "text").await,
            Err(ProtocolError::NotJoined("D".into()))
        );
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("alice", "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_snapshot_then_next_change_applies() {
        let mut replicas = HashMap::new();
        assert_eq!(integrate(&mut replicas, &snapshot("Hello", 3)), None);
        assert_eq!(integrate(&mut replicas, &change("Hello", "Hello World", 4)), None);
        assert_eq!(
            replicas["D"],
            LocalDocument { content: "Hello World".into(), version: 4 }
        );
    }

    #[test]
    fn test_old_change_is_ignored() {
        let mut replicas = HashMap::new();
        integrate(&mut replicas, &snapshot("Hello World", 4));
        assert_eq!(integrate(&mut replicas, &change("Hello", "Hello World", 4)), None);
        assert_eq!(replicas["D"].version, 4);
    }

    #[test]
    fn test_version_gap_requests_resync() {
        let mut replicas = HashMap::new();
        integrate(&mut replicas, &snapshot("Hello", 3));
        assert_eq!(
            integrate(&mut replicas, &change("Hello", "Hello!", 6)),
            Some("D".to_string())
        );
        assert_eq!(replicas["D"].content, "Hello");
    }

    #[test]
    fn test_unapplicable_change_requests_resync() {
        let mut replicas = HashMap::new();
        integrate(&mut replicas, &snapshot("Entirely different text", 0));
        let resync = integrate(&mut replicas, &change("Some other words here", "Some other words there", 1));
        assert_eq!(resync, Some("D".to_string()));
        assert_eq!(replicas["D"].version, 0);
    }

    #[test]
    fn test_sync_required_for_open_document_only() {
        let mut replicas = HashMap::new();
        let required = ServerMessage::SyncRequired { document_id: "D".into(), current_version: 5 };
        assert_eq!(integrate(&mut replicas, &required), None);
        integrate(&mut replicas, &snapshot("x", 4));
        assert_eq!(integrate(&mut replicas, &required), Some("D".to_string()));
    }

    #[test]
    fn test_skipped_hunks_trigger_resync() {
        let mut replicas = HashMap::new();
        integrate(&mut replicas, &snapshot("x", 4));
        let failed = ServerMessage::HunksFailed { document_id: "D".into(), version: 5, failed_hunks: vec![0] };
        assert_eq!(integrate(&mut replicas, &failed), Some("D".to_string()));
    }
}
