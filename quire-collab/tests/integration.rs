//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients, verifying the
//! full pipeline from socket frames through the hub into the version graph.

use futures_util::{SinkExt, StreamExt};
use quire_collab::client::{ConnectionState, SyncClient, SyncEvent};
use quire_collab::hub::CollaborationHub;
use quire_collab::protocol::{ClientId, ClientMessage, ServerMessage};
use quire_collab::server::{ServerConfig, SyncServer};
use quire_core::{ErrorKind, MemoryStore, Metadata, PatchSet, VersionGraphStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    url: String,
    graph: Arc<VersionGraphStore<MemoryStore>>,
    hub: Arc<CollaborationHub>,
}

/// Start a server on a free port.
async fn start_test_server() -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_clients_per_session: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = SyncServer::in_memory(config);
    let graph = server.graph().clone();
    let hub = server.hub().clone();
    tokio::spawn(async move {
        server.run_on(listener).await.unwrap();
    });
    // Give the graph watcher time to subscribe
    sleep(Duration::from_millis(50)).await;
    TestServer { url: format!("ws://127.0.0.1:{port}"), graph, hub }
}

// ─── Raw socket helpers ──────────────────────────────────────────────────────

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

async fn recv_until(ws: &mut Ws, wanted: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        let message = recv(ws).await;
        if wanted(&message) {
            return message;
        }
    }
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    ws.send(Message::Text(message.encode().unwrap().into())).await.unwrap();
}

async fn connect(url: &str) -> (Ws, ClientId) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Welcome { client_id } => (ws, client_id),
        other => panic!("expected welcome, got {other:?}"),
    }
}

/// Connect and join `document_id`, returning the snapshot content and version.
async fn connect_and_join(url: &str, document_id: &str, username: &str) -> (Ws, ClientId, String, u64) {
    let (mut ws, client_id) = connect(url).await;
    send(
        &mut ws,
        &ClientMessage::Join { document_id: document_id.into(), username: username.into() },
    )
    .await;
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::Document(_))).await {
        ServerMessage::Document(snapshot) => (ws, client_id, snapshot.content, snapshot.version),
        _ => unreachable!(),
    }
}

fn change(document_id: &str, from: &str, to: &str, version: u64) -> ClientMessage {
    ClientMessage::Change {
        document_id: document_id.into(),
        patch_set: PatchSet::between(from, to).to_text(),
        version,
    }
}

async fn wait_for_content(client: &SyncClient, document_id: &str, expected: &str) -> u64 {
    for _ in 0..200 {
        if let Some((content, version)) = client.content(document_id).await {
            if content == expected {
                return version;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never saw {expected:?} in {document_id}", client.username());
}

// ─── Connection ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_welcomes_connections() {
    let server = start_test_server().await;
    let (_ws, client_id) = connect(&server.url).await;
    assert!(!client_id.is_nil());
}

#[tokio::test]
async fn test_ping_and_garbage() {
    let server = start_test_server().await;
    let (mut ws, _) = connect(&server.url).await;

    send(&mut ws, &ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Pong);

    ws.send(Message::Text("{not json".into())).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorKind::InvalidInput),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_creates_document() {
    let server = start_test_server().await;
    let (_ws, _, content, version) = connect_and_join(&server.url, "fresh", "alice").await;
    assert_eq!(content, "");
    assert_eq!(version, 0);
    assert!(server.graph.contains_document("fresh").unwrap());
}

#[tokio::test]
async fn test_join_hydrates_from_head() {
    let server = start_test_server().await;
    server.graph.initialize_document("D", "stored text").unwrap();
    let (_ws, _, content, _) = connect_and_join(&server.url, "D", "alice").await;
    assert_eq!(content, "stored text");
}

// ─── Editing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_change_reaches_other_clients() {
    let server = start_test_server().await;
    let (mut alice, alice_id, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;
    recv_until(&mut alice, |m| matches!(m, ServerMessage::UserJoined { .. })).await;

    send(&mut alice, &change("D", "", "Hello", 0)).await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::Change { .. })).await {
        ServerMessage::Change { version, client_id, patch_set, .. } => {
            assert_eq!(version, 1);
            assert_eq!(client_id, Some(alice_id));
            let (content, _) = PatchSet::from_text(&patch_set).unwrap().apply("");
            assert_eq!(content, "Hello");
        }
        _ => unreachable!(),
    }
    assert_eq!(server.hub.content("D").await.unwrap(), ("Hello".to_string(), 1));
}

#[tokio::test]
async fn test_stale_change_gets_sync_required() {
    let server = start_test_server().await;
    let (mut alice, _, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;

    send(&mut alice, &change("D", "", "abc", 0)).await;
    recv_until(&mut bob, |m| matches!(m, ServerMessage::Change { .. })).await;

    send(&mut bob, &change("D", "", "xyz", 0)).await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::SyncRequired { .. })).await {
        ServerMessage::SyncRequired { document_id, current_version } => {
            assert_eq!(document_id, "D");
            assert_eq!(current_version, 1);
        }
        _ => unreachable!(),
    }
    assert_eq!(server.hub.content("D").await.unwrap(), ("abc".to_string(), 1));
}

#[tokio::test]
async fn test_unmatched_hunks_are_reported_to_submitter() {
    let server = start_test_server().await;
    let base = "The cat sat on the mat. Nothing else happened that day at all.";
    let edited = "The dog sat on the mat. Nothing else happened that day at all.";
    server.graph.initialize_document("D", base).unwrap();
    let (mut alice, _, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;

    let mut patch_set = PatchSet::between(base, edited).to_text();
    patch_set.push_str(&PatchSet::between("Words it never had", "Words it never saw").to_text());
    send(&mut alice, &ClientMessage::Change { document_id: "D".into(), patch_set, version: 0 }).await;

    match recv_until(&mut alice, |m| matches!(m, ServerMessage::HunksFailed { .. })).await {
        ServerMessage::HunksFailed { version, failed_hunks, .. } => {
            assert_eq!(version, 1);
            assert_eq!(failed_hunks, vec![1]);
        }
        _ => unreachable!(),
    }
    recv_until(&mut bob, |m| matches!(m, ServerMessage::Change { version: 1, .. })).await;
    assert_eq!(server.hub.content("D").await.unwrap(), (edited.to_string(), 1));
}

#[tokio::test]
async fn test_clients_converge() {
    let server = start_test_server().await;
    let mut alice = SyncClient::new("alice", &server.url);
    let mut bob = SyncClient::new("bob", &server.url);
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    alice.join("D").await.unwrap();
    bob.join("D").await.unwrap();
    wait_for_content(&alice, "D", "").await;
    wait_for_content(&bob, "D", "").await;

    alice.edit("D", "Hello").await.unwrap();
    assert_eq!(wait_for_content(&bob, "D", "Hello").await, 1);

    bob.edit("D", "Hello World").await.unwrap();
    assert_eq!(wait_for_content(&alice, "D", "Hello World").await, 2);
}

#[tokio::test]
async fn test_concurrent_edits_converge_on_server_state() {
    let server = start_test_server().await;
    server.graph.initialize_document("D", "Hello").unwrap();
    let mut alice = SyncClient::new("alice", &server.url);
    let mut bob = SyncClient::new("bob", &server.url);
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    alice.join("D").await.unwrap();
    bob.join("D").await.unwrap();
    wait_for_content(&alice, "D", "Hello").await;
    wait_for_content(&bob, "D", "Hello").await;

    let (a, b) = tokio::join!(alice.edit("D", "Hello alice"), bob.edit("D", "Hello bob"));
    a.unwrap();
    b.unwrap();

    for _ in 0..200 {
        let (server_content, server_version) = server.hub.content("D").await.unwrap();
        let alice_view = alice.content("D").await.unwrap();
        let bob_view = bob.content("D").await.unwrap();
        if alice_view == (server_content.clone(), server_version) && bob_view == alice_view {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("replicas did not converge");
}

#[tokio::test]
async fn test_client_events() {
    let server = start_test_server().await;
    let mut client = SyncClient::new("alice", &server.url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(SyncEvent::Connected) => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(SyncEvent::Message(ServerMessage::Welcome { client_id })) => {
            assert_eq!(client.client_id().await, Some(client_id));
        }
        other => panic!("expected welcome, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    client.ping().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(SyncEvent::Message(ServerMessage::Pong)) => {}
        other => panic!("expected pong, got {other:?}"),
    }
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_section_lock_conflict() {
    let server = start_test_server().await;
    let (mut alice, alice_id, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;

    let lock = |document_id: &str| ClientMessage::LockSection {
        document_id: document_id.into(),
        section_id: "s1".into(),
    };
    send(&mut alice, &lock("D")).await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::SectionLocked { .. })).await {
        ServerMessage::SectionLocked { client_id, .. } => assert_eq!(client_id, alice_id),
        _ => unreachable!(),
    }

    send(&mut bob, &lock("D")).await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::Error { .. })).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorKind::LockHeld),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_disconnect_releases_presence() {
    let server = start_test_server().await;
    let (mut alice, alice_id, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;

    send(
        &mut alice,
        &ClientMessage::LockSection { document_id: "D".into(), section_id: "s1".into() },
    )
    .await;
    recv_until(&mut bob, |m| matches!(m, ServerMessage::SectionLocked { .. })).await;

    alice.close(None).await.unwrap();
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::SectionUnlocked { .. })).await {
        ServerMessage::SectionUnlocked { client_id, section_id, .. } => {
            assert_eq!(client_id, alice_id);
            assert_eq!(section_id, "s1");
        }
        _ => unreachable!(),
    }
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::UserLeft { .. })).await {
        ServerMessage::UserLeft { client_id, .. } => assert_eq!(client_id, alice_id),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_comment_broadcast() {
    let server = start_test_server().await;
    let (mut alice, _, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;

    send(
        &mut alice,
        &ClientMessage::Comment { document_id: "D".into(), text: "typo here".into(), anchor: None },
    )
    .await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::Comment { .. })).await {
        ServerMessage::Comment { comment, .. } => {
            assert_eq!(comment.author, "alice");
            assert_eq!(comment.text, "typo here");
        }
        _ => unreachable!(),
    }
}

// ─── Version graph ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_commit_is_announced_and_persisted() {
    let server = start_test_server().await;
    let (mut alice, _, _, _) = connect_and_join(&server.url, "D", "alice").await;
    let (mut bob, _, _, _) = connect_and_join(&server.url, "D", "bob").await;

    send(&mut alice, &change("D", "", "First draft", 0)).await;
    send(&mut alice, &ClientMessage::Commit { document_id: "D".into(), metadata: Metadata::new() }).await;

    let committed = recv_until(&mut bob, |m| matches!(m, ServerMessage::Committed { .. })).await;
    recv_until(&mut alice, |m| matches!(m, ServerMessage::Committed { .. })).await;
    let head = server.graph.head("D").unwrap();
    assert_eq!(head.content, "First draft");
    assert_eq!(head.metadata.get("author").map(String::as_str), Some("alice"));
    match committed {
        ServerMessage::Committed { version_id, branch, content_hash, .. } => {
            assert_eq!(version_id, head.id);
            assert_eq!(branch, "main");
            assert_eq!(content_hash, head.content_hash);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_commit_requires_join() {
    let server = start_test_server().await;
    let (mut ws, _) = connect(&server.url).await;
    send(&mut ws, &ClientMessage::Commit { document_id: "D".into(), metadata: Metadata::new() }).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorKind::InvalidInput),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_restore_pushes_old_content_into_session() {
    let server = start_test_server().await;
    let root = server.graph.initialize_document("D", "original").unwrap();
    server.graph.create_version("D", "rewritten", Metadata::new()).unwrap();
    // Let the graph watcher drain the setup events
    sleep(Duration::from_millis(50)).await;

    let (mut alice, _, content, _) = connect_and_join(&server.url, "D", "alice").await;
    assert_eq!(content, "rewritten");

    send(&mut alice, &ClientMessage::Restore { document_id: "D".into(), version_id: root.id }).await;
    match recv_until(&mut alice, |m| matches!(m, ServerMessage::Change { .. })).await {
        ServerMessage::Change { client_id, version, .. } => {
            assert_eq!(client_id, None);
            assert_eq!(version, 1);
        }
        _ => unreachable!(),
    }
    recv_until(&mut alice, |m| matches!(m, ServerMessage::Committed { .. })).await;
    assert_eq!(server.hub.content("D").await.unwrap().0, "original");
    assert_eq!(server.graph.head("D").unwrap().content, "original");
}

#[tokio::test]
async fn test_switch_branch_loads_branch_head() {
    let server = start_test_server().await;
    let root = server.graph.initialize_document("D", "main text").unwrap();
    server.graph.create_branch("D", "draft", root.id).unwrap();
    server.graph.switch_branch("D", "draft").unwrap();
    server.graph.create_version("D", "draft text", Metadata::new()).unwrap();
    server.graph.switch_branch("D", "main").unwrap();
    sleep(Duration::from_millis(50)).await;

    let (mut alice, _, content, _) = connect_and_join(&server.url, "D", "alice").await;
    assert_eq!(content, "main text");

    send(&mut alice, &ClientMessage::SwitchBranch { document_id: "D".into(), branch: "draft".into() }).await;
    match recv_until(&mut alice, |m| matches!(m, ServerMessage::BranchSwitched { .. })).await {
        ServerMessage::BranchSwitched { branch, .. } => assert_eq!(branch, "draft"),
        _ => unreachable!(),
    }
    assert_eq!(server.hub.content("D").await.unwrap().0, "draft text");

    send(&mut alice, &ClientMessage::SwitchBranch { document_id: "D".into(), branch: "nope".into() }).await;
    match recv_until(&mut alice, |m| matches!(m, ServerMessage::Error { .. })).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorKind::NotFound),
        _ => unreachable!(),
    }
}
