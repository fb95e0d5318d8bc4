//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── forwarder(D) ◄── SessionChannel(D)
//!            ├── handle_connection ┤                          ▲
//! Client B ──┘   (per socket)      └── forwarder(E) ◄──       │
//!                     │                                 CollaborationHub
//!                     │ commit / switch / restore               ▲
//!                     ▼                                         │ follow_head
//!            VersionGraphStore ── GraphEvent ──► graph watcher ─┘ + committed
//!                     │
//!                     ▼
//!               DurableStore (RocksDB or memory)
//! ```
//!
//! Every socket gets a server-assigned client id in a `welcome` frame. Joined
//! documents each get a forwarder task that filters the session channel for
//! this client and queues frames on the socket's outbound mpsc; direct replies
//! are written by the connection loop itself.
//!
//! Branch heads that move through the graph (commit, restore, branch switch,
//! merge into the current branch) are pushed into live sessions by the graph
//! watcher, so every participant converges on the new content.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use quire_core::{
    DurableStore, ErrorKind, GraphError, GraphEvent, MemoryStore, VersionGraphStore, VersionId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Outbound;
use crate::hub::{CollaborationHub, HubConfig};
use crate::protocol::{ClientId, ClientMessage, ProtocolError, ServerMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum clients per document session
    pub max_clients_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Interval of the stale lock sweep, in seconds
    pub heartbeat_interval_secs: u64,
    /// Age after which section locks are released, in seconds
    pub section_lock_ttl_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_session: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            section_lock_ttl_secs: 300,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `QUIRE_BIND_ADDR`, `QUIRE_STORAGE_PATH`,
    /// `QUIRE_HEARTBEAT_SECS` and `QUIRE_LOCK_TTL_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Ephemeral port, small buffers and a fast sweep, for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_clients_per_session: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 1,
            ..Self::default()
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("QUIRE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("QUIRE_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        let seconds = |key: &str, default: u64| match lookup(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!("Ignoring {key}={raw:?}: not a number of seconds");
                default
            }),
            None => default,
        };
        config.heartbeat_interval_secs = seconds("QUIRE_HEARTBEAT_SECS", config.heartbeat_interval_secs);
        config.section_lock_ttl_secs = seconds("QUIRE_LOCK_TTL_SECS", config.section_lock_ttl_secs);
        config
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_clients_per_session: self.max_clients_per_session,
            section_lock_ttl: Duration::from_secs(self.section_lock_ttl_secs),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub commits: u64,
    pub sync_required: u64,
}

/// The collaboration server.
pub struct SyncServer<S: DurableStore + 'static> {
    config: ServerConfig,
    graph: Arc<VersionGraphStore<S>>,
    hub: Arc<CollaborationHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer<MemoryStore> {
    /// Server over a process-local store.
    pub fn in_memory(config: ServerConfig) -> Self {
        let graph = Arc::new(VersionGraphStore::new(Arc::new(MemoryStore::new())));
        Self::new(config, graph)
    }
}

impl<S: DurableStore + 'static> SyncServer<S> {
    pub fn new(config: ServerConfig, graph: Arc<VersionGraphStore<S>>) -> Self {
        let hub = Arc::new(CollaborationHub::new(config.hub_config()));
        Self {
            config,
            graph,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until accept fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        let watcher = tokio::spawn(watch_graph(
            self.graph.subscribe(),
            self.graph.clone(),
            self.hub.clone(),
        ));
        let sweeper = tokio::spawn(sweep_locks(
            self.hub.clone(),
            Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
            Duration::from_secs(self.config.section_lock_ttl_secs),
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            log::debug!("New TCP connection from {addr}");

            let graph = self.graph.clone();
            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, graph, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        watcher.abort();
        sweeper.abort();
        result.map_err(Into::into)
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.hub.session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<CollaborationHub> {
        &self.hub
    }

    pub fn graph(&self) -> &Arc<VersionGraphStore<S>> {
        &self.graph
    }
}

// ─── Connections ──────────────────────────────────────────────────────

struct Membership {
    username: String,
    forwarder: JoinHandle<()>,
}

/// Per-socket state.
struct Connection<S: DurableStore + 'static> {
    client_id: ClientId,
    graph: Arc<VersionGraphStore<S>>,
    hub: Arc<CollaborationHub>,
    stats: Arc<RwLock<ServerStats>>,
    outbound: mpsc::Sender<String>,
    memberships: HashMap<String, Membership>,
}

async fn send_message(ws_sender: &mut WsSink, message: &ServerMessage) -> Result<(), BoxError> {
    ws_sender.send(Message::Text(message.encode()?.into())).await?;
    Ok(())
}

async fn handle_connection<S: DurableStore + 'static>(
    stream: TcpStream,
    addr: SocketAddr,
    graph: Arc<VersionGraphStore<S>>,
    hub: Arc<CollaborationHub>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = Uuid::new_v4();
    log::info!("WebSocket connection established from {addr} as {client_id}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (outbound, mut outbound_rx) = mpsc::channel::<String>(hub.config().broadcast_capacity);
    let mut conn = Connection {
        client_id,
        graph,
        hub,
        stats: stats.clone(),
        outbound,
        memberships: HashMap::new(),
    };

    let result = match send_message(&mut ws_sender, &ServerMessage::Welcome { client_id }).await {
        Err(e) => Err(e),
        Ok(()) => loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let reply = match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientMessage::decode(text.as_str()) {
                                Ok(message) => conn.dispatch(message).await,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    Some(ServerMessage::error(e.kind(), e.to_string()))
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let e = ProtocolError::UnexpectedBinary;
                            Some(ServerMessage::error(e.kind(), e.to_string()))
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                            None
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => None,
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = send_message(&mut ws_sender, &reply).await {
                            break Err(e);
                        }
                    }
                }

                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        break Err(e.into());
                    }
                }
            }
        },
    };

    conn.close().await;
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

fn graph_failure(e: &GraphError) -> ServerMessage {
    ServerMessage::error(e.kind(), e.to_string())
}

impl<S: DurableStore + 'static> Connection<S> {
    /// Handle one client frame. Returns the direct reply, if any.
    async fn dispatch(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        let client_id = self.client_id;
        match message {
            ClientMessage::Join { document_id, username } => self.join(document_id, username).await,

            ClientMessage::Leave { document_id } => {
                if let Some(membership) = self.memberships.remove(&document_id) {
                    membership.forwarder.abort();
                }
                self.hub
                    .leave(&document_id, client_id)
                    .await
                    .err()
                    .map(|e| ServerMessage::error(e.kind(), e.to_string()))
            }

            ClientMessage::Change { document_id, patch_set, version } => {
                match self.hub.submit_change(&document_id, client_id, &patch_set, version).await {
                    Ok(outcome) if outcome.failed_hunks.is_empty() => None,
                    Ok(outcome) => Some(ServerMessage::HunksFailed {
                        document_id,
                        version: outcome.version,
                        failed_hunks: outcome.failed_hunks,
                    }),
                    Err(e) => match e.resync_version() {
                        Some(current_version) => {
                            self.stats.write().await.sync_required += 1;
                            Some(ServerMessage::SyncRequired { document_id, current_version })
                        }
                        None => Some(ServerMessage::error(e.kind(), e.to_string())),
                    },
                }
            }

            ClientMessage::Cursor { document_id, position } => self
                .hub
                .update_cursor(&document_id, client_id, position)
                .await
                .err()
                .map(|e| ServerMessage::error(e.kind(), e.to_string())),

            ClientMessage::Selection { document_id, range } => self
                .hub
                .update_selection(&document_id, client_id, range)
                .await
                .err()
                .map(|e| ServerMessage::error(e.kind(), e.to_string())),

            ClientMessage::Comment { document_id, text, anchor } => self
                .hub
                .add_comment(&document_id, client_id, &text, anchor)
                .await
                .err()
                .map(|e| ServerMessage::error(e.kind(), e.to_string())),

            ClientMessage::CommentRemoved { document_id, comment_id } => self
                .hub
                .remove_comment(&document_id, client_id, comment_id)
                .await
                .err()
                .map(|e| ServerMessage::error(e.kind(), e.to_string())),

            ClientMessage::LockSection { document_id, section_id } => self
                .hub
                .lock_section(&document_id, &section_id, client_id)
                .await
                .err()
                .map(|e| ServerMessage::error(e.kind(), e.to_string())),

            ClientMessage::UnlockSection { document_id, section_id } => self
                .hub
                .unlock_section(&document_id, &section_id, client_id)
                .await
                .err()
                .map(|e| ServerMessage::error(e.kind(), e.to_string())),

            ClientMessage::Commit { document_id, metadata } => {
                let username = match self.memberships.get(&document_id) {
                    Some(membership) => membership.username.clone(),
                    None => return Some(self.not_joined(&document_id)),
                };
                let graph = &self.graph;
                let saved = self
                    .hub
                    .commit(&document_id, client_id, |content| {
                        let node = graph.save(&document_id, &username, content, metadata)?;
                        let branch = graph.current_branch(&document_id)?.name;
                        Ok((node, branch))
                    })
                    .await;
                match saved {
                    Ok((node, version)) => {
                        self.stats.write().await.commits += 1;
                        log::info!("{username} committed {document_id} session version {version} as {}", node.id);
                        None
                    }
                    Err(e) => Some(ServerMessage::error(e.kind(), e.to_string())),
                }
            }

            ClientMessage::SwitchBranch { document_id, branch } => {
                if !self.memberships.contains_key(&document_id) {
                    return Some(self.not_joined(&document_id));
                }
                self.graph
                    .switch_branch(&document_id, &branch)
                    .err()
                    .map(|e| graph_failure(&e))
            }

            ClientMessage::Restore { document_id, version_id } => {
                if !self.memberships.contains_key(&document_id) {
                    return Some(self.not_joined(&document_id));
                }
                self.graph.restore(&document_id, version_id).err().map(|e| graph_failure(&e))
            }

            ClientMessage::Ping => Some(ServerMessage::Pong),
        }
    }

    async fn join(&mut self, document_id: String, username: String) -> Option<ServerMessage> {
        let seed = if self.hub.has_session(&document_id).await {
            None
        } else {
            match self.hydrate(&document_id) {
                Ok(content) => Some(content),
                Err(e) => return Some(graph_failure(&e)),
            }
        };

        match self.hub.join(&document_id, self.client_id, &username, seed).await {
            Ok(joined) => {
                let forwarder = spawn_forwarder(
                    self.hub.clone(),
                    document_id.clone(),
                    self.client_id,
                    joined.receiver,
                    self.outbound.clone(),
                );
                if let Some(previous) = self.memberships.insert(document_id, Membership { username, forwarder }) {
                    previous.forwarder.abort();
                }
                Some(ServerMessage::Document(joined.snapshot))
            }
            Err(e) => Some(ServerMessage::error(e.kind(), e.to_string())),
        }
    }

    /// Head content of the current branch, creating the document on first use.
    fn hydrate(&self, document_id: &str) -> Result<String, GraphError> {
        if self.graph.contains_document(document_id)? {
            return Ok(self.graph.head(document_id)?.content);
        }
        match self.graph.initialize_document(document_id, "") {
            Ok(root) => Ok(root.content),
            Err(GraphError::DocumentExists(_)) => Ok(self.graph.head(document_id)?.content),
            Err(e) => Err(e),
        }
    }

    fn not_joined(&self, document_id: &str) -> ServerMessage {
        ServerMessage::error(
            ErrorKind::InvalidInput,
            format!("client {} has not joined {document_id}", self.client_id),
        )
    }

    async fn close(&mut self) {
        for (_, membership) in self.memberships.drain() {
            membership.forwarder.abort();
        }
        self.hub.disconnect(self.client_id).await;
    }
}

/// Copy session messages addressed to `client_id` onto its socket queue.
fn spawn_forwarder(
    hub: Arc<CollaborationHub>,
    document_id: String,
    client_id: ClientId,
    mut receiver: broadcast::Receiver<Arc<Outbound>>,
    outbound: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match receiver.recv().await {
                Ok(out) if out.is_for(client_id) => out.message.clone(),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Client {client_id} lagged by {skipped} messages on {document_id}, resending snapshot");
                    hub.record_lag(&document_id, skipped).await;
                    match hub.snapshot(&document_id).await {
                        Ok(snapshot) => ServerMessage::Document(snapshot),
                        Err(_) => break,
                    }
                }
                Err(RecvError::Closed) => break,
            };
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode {} for {client_id}: {e}", message.kind());
                    continue;
                }
            };
            if outbound.send(text).await.is_err() {
                break;
            }
        }
        log::debug!("Forwarder for {client_id} on {document_id} stopped");
    })
}

// ─── Background tasks ─────────────────────────────────────────────────

async fn watch_graph<S: DurableStore + 'static>(
    mut events: broadcast::Receiver<GraphEvent>,
    graph: Arc<VersionGraphStore<S>>,
    hub: Arc<CollaborationHub>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let document_id = event.document_id().to_string();
                if !hub.has_session(&document_id).await {
                    continue;
                }
                if let Err(e) = apply_event(&graph, &hub, event).await {
                    log::warn!("Failed to push graph change into session {document_id}: {e}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Graph watcher missed {skipped} events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn apply_event<S: DurableStore + 'static>(
    graph: &VersionGraphStore<S>,
    hub: &CollaborationHub,
    event: GraphEvent,
) -> Result<(), BoxError> {
    match event {
        GraphEvent::VersionCreated { document_id, branch, version_id }
        | GraphEvent::Restored { document_id, branch, version_id, .. } => {
            announce_head(graph, hub, &document_id, &branch, version_id).await
        }
        GraphEvent::BranchSwitched { document_id, branch, .. } => {
            let current = graph.current_branch(&document_id)?;
            if current.name != branch {
                log::debug!("Skipping stale switch of {document_id} to {branch}");
                return Ok(());
            }
            let head = graph.head(&document_id)?;
            let message = ServerMessage::BranchSwitched {
                document_id: document_id.clone(),
                branch,
                version_id: head.id,
            };
            hub.replace_and_announce(&document_id, &head.content, message).await?;
            Ok(())
        }
        GraphEvent::Merged { document_id, target, version_id, .. } => {
            if graph.current_branch(&document_id)?.name != target {
                return Ok(());
            }
            announce_head(graph, hub, &document_id, &target, version_id).await
        }
        GraphEvent::DocumentInitialized { .. }
        | GraphEvent::BranchCreated { .. }
        | GraphEvent::TagCreated { .. } => Ok(()),
    }
}

/// Move the session to a new current-branch head and tell everyone.
///
/// Events can trail the graph; one whose version is no longer the head is
/// skipped, since a later event covers the newer state. Heads the session
/// committed itself were announced at commit time and are left alone.
async fn announce_head<S: DurableStore + 'static>(
    graph: &VersionGraphStore<S>,
    hub: &CollaborationHub,
    document_id: &str,
    branch: &str,
    version_id: VersionId,
) -> Result<(), BoxError> {
    let node = graph.head(document_id)?;
    if node.id != version_id {
        log::debug!("Skipping stale head {version_id} of {document_id}");
        return Ok(());
    }
    let message = ServerMessage::Committed {
        document_id: document_id.to_string(),
        version_id,
        content_hash: node.content_hash,
        branch: branch.to_string(),
    };
    hub.follow_head(document_id, version_id, &node.content, message).await?;
    Ok(())
}

async fn sweep_locks(hub: Arc<CollaborationHub>, every: Duration, ttl: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let released = hub.expire_stale_locks(ttl).await;
        if released > 0 {
            log::info!("Released {released} stale section locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::PatchSet;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_clients_per_session, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("QUIRE_BIND_ADDR", "0.0.0.0:7000"),
            ("QUIRE_STORAGE_PATH", "/var/lib/quire"),
            ("QUIRE_HEARTBEAT_SECS", "5"),
            ("QUIRE_LOCK_TTL_SECS", "soon"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/quire")));
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.section_lock_ttl_secs, 300);
    }

    #[test]
    fn test_hub_config_mirrors_server_config() {
        let config = ServerConfig {
            max_clients_per_session: 7,
            broadcast_capacity: 64,
            section_lock_ttl_secs: 10,
            ..ServerConfig::default()
        };
        let hub = config.hub_config();
        assert_eq!(hub.max_clients_per_session, 7);
        assert_eq!(hub.broadcast_capacity, 64);
        assert_eq!(hub.section_lock_ttl, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::in_memory(ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.commits, 0);
    }

    #[tokio::test]
    async fn test_commit_event_reaches_live_session() {
        let server = SyncServer::in_memory(ServerConfig::default());
        let graph = server.graph().clone();
        let hub = server.hub().clone();
        graph.initialize_document("D", "draft").unwrap();

        let alice = Uuid::new_v4();
        let mut rx = hub.join("D", alice, "alice", Some("draft".into())).await.unwrap().receiver;

        let node = graph.create_version("D", "final", Default::default()).unwrap();
        let event = GraphEvent::VersionCreated {
            document_id: "D".into(),
            branch: "main".into(),
            version_id: node.id,
        };
        apply_event(&graph, &hub, event).await.unwrap();

        assert_eq!(hub.content("D").await.unwrap(), ("final".to_string(), 1));
        assert!(matches!(rx.recv().await.unwrap().message, ServerMessage::Change { .. }));
        match &rx.recv().await.unwrap().message {
            ServerMessage::Committed { version_id, branch, content_hash, .. } => {
                assert_eq!(*version_id, node.id);
                assert_eq!(branch, "main");
                assert_eq!(content_hash, &node.content_hash);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merge_into_other_branch_leaves_session_alone() {
        let server = SyncServer::in_memory(ServerConfig::default());
        let graph = server.graph().clone();
        let hub = server.hub().clone();
        let root = graph.initialize_document("D", "base").unwrap();
        hub.join("D", Uuid::new_v4(), "alice", Some("base".into())).await.unwrap();

        let event = GraphEvent::Merged {
            document_id: "D".into(),
            source: "main".into(),
            target: "feature".into(),
            version_id: root.id,
            conflicts: 0,
        };
        apply_event(&graph, &hub, event).await.unwrap();
        assert_eq!(hub.content("D").await.unwrap(), ("base".to_string(), 0));
    }

    #[tokio::test]
    async fn test_commit_keeps_edits_that_land_before_its_event() {
        let server = SyncServer::in_memory(ServerConfig::default());
        let graph = server.graph().clone();
        let hub = server.hub().clone();
        graph.initialize_document("D", "draft").unwrap();
        let mut events = graph.subscribe();

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        hub.join("D", alice, "alice", Some("base".into())).await.unwrap();
        hub.join("D", bob, "bob", None).await.unwrap();

        let (node, _) = hub
            .commit("D", alice, |content| {
                let node = graph.save("D", "alice", content, Default::default())?;
                Ok((node, graph.current_branch("D")?.name))
            })
            .await
            .unwrap();
        assert_eq!(node.content, "base");

        let change = PatchSet::between("base", "base plus bob").to_text();
        hub.submit_change("D", bob, &change, 0).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(&event, GraphEvent::VersionCreated { version_id, .. } if *version_id == node.id));
        apply_event(&graph, &hub, event).await.unwrap();
        assert_eq!(hub.content("D").await.unwrap(), ("base plus bob".to_string(), 1));

        // Committing the head's content again writes nothing and publishes nothing.
        hub.commit("D", alice, |_| Ok((graph.save("D", "alice", "base", Default::default())?, "main".into())))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(hub.content("D").await.unwrap(), ("base plus bob".to_string(), 1));
    }
}
