//! Integration tests for presence: cursors, selections and participants.
//!
//! These tests start a real server and connect raw sockets, verifying that
//! presence updates fan out to other participants and show up in the
//! snapshot handed to late joiners.

use futures_util::{SinkExt, StreamExt};
use quire_collab::presence::color_for;
use quire_collab::protocol::{ClientId, ClientMessage, DocumentSnapshot, ServerMessage, TextRange};
use quire_collab::server::{ServerConfig, SyncServer};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its url.
async fn start_test_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::in_memory(ServerConfig::for_testing());
    tokio::spawn(async move {
        server.run_on(listener).await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

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

async fn send(ws: &mut Ws, message: ClientMessage) {
    ws.send(Message::Text(message.encode().unwrap().into())).await.unwrap();
}

/// Round-trip a ping so every earlier frame from this socket is processed.
async fn settle(ws: &mut Ws) {
    send(ws, ClientMessage::Ping).await;
    recv_until(ws, |m| matches!(m, ServerMessage::Pong)).await;
}

/// Connect, join `doc` as `username` and return the socket, id and snapshot.
async fn join(url: &str, doc: &str, username: &str) -> (Ws, ClientId, DocumentSnapshot) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let client_id = match recv(&mut ws).await {
        ServerMessage::Welcome { client_id } => client_id,
        other => panic!("expected welcome, got {other:?}"),
    };
    send(
        &mut ws,
        ClientMessage::Join { document_id: doc.into(), username: username.into() },
    )
    .await;
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::Document(_))).await {
        ServerMessage::Document(snapshot) => (ws, client_id, snapshot),
        _ => unreachable!(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_user_joined_carries_stable_color() {
    let url = start_test_server().await;
    let (mut alice, _, _) = join(&url, "D", "alice").await;
    let (_bob, bob_id, snapshot) = join(&url, "D", "bob").await;

    match recv_until(&mut alice, |m| matches!(m, ServerMessage::UserJoined { .. })).await {
        ServerMessage::UserJoined { client_id, username, color, .. } => {
            assert_eq!(client_id, bob_id);
            assert_eq!(username, "bob");
            assert_eq!(color, color_for(bob_id));
        }
        _ => unreachable!(),
    }

    assert_eq!(snapshot.clients.len(), 2);
    for info in &snapshot.clients {
        assert_eq!(info.color, color_for(info.client_id));
    }
}

#[tokio::test]
async fn test_cursor_and_selection_reach_others() {
    let url = start_test_server().await;
    let (mut alice, alice_id, _) = join(&url, "D", "alice").await;
    let (mut bob, _, _) = join(&url, "D", "bob").await;

    send(&mut alice, ClientMessage::Cursor { document_id: "D".into(), position: 4 }).await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::Cursor { .. })).await {
        ServerMessage::Cursor { client_id, position, .. } => {
            assert_eq!(client_id, alice_id);
            assert_eq!(position, 4);
        }
        _ => unreachable!(),
    }

    let range = TextRange::new(1, 3);
    send(
        &mut alice,
        ClientMessage::Selection { document_id: "D".into(), range: Some(range) },
    )
    .await;
    match recv_until(&mut bob, |m| matches!(m, ServerMessage::Selection { .. })).await {
        ServerMessage::Selection { client_id, range: received, .. } => {
            assert_eq!(client_id, alice_id);
            assert_eq!(received, Some(range));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_late_joiner_sees_presence_in_snapshot() {
    let url = start_test_server().await;
    let (mut alice, alice_id, _) = join(&url, "D", "alice").await;

    send(&mut alice, ClientMessage::Cursor { document_id: "D".into(), position: 2 }).await;
    send(
        &mut alice,
        ClientMessage::Selection { document_id: "D".into(), range: Some(TextRange::new(0, 2)) },
    )
    .await;
    settle(&mut alice).await;

    let (_bob, _, snapshot) = join(&url, "D", "bob").await;
    assert_eq!(snapshot.cursors.get(&alice_id), Some(&2));
    assert_eq!(snapshot.selections.get(&alice_id), Some(&TextRange::new(0, 2)));
}

#[tokio::test]
async fn test_cleared_selection_leaves_snapshot() {
    let url = start_test_server().await;
    let (mut alice, alice_id, _) = join(&url, "D", "alice").await;

    send(
        &mut alice,
        ClientMessage::Selection { document_id: "D".into(), range: Some(TextRange::new(0, 1)) },
    )
    .await;
    send(&mut alice, ClientMessage::Selection { document_id: "D".into(), range: None }).await;
    settle(&mut alice).await;

    let (_bob, _, snapshot) = join(&url, "D", "bob").await;
    assert!(!snapshot.selections.contains_key(&alice_id));
}

#[tokio::test]
async fn test_leave_drops_presence() {
    let url = start_test_server().await;
    let (mut alice, _, _) = join(&url, "D", "alice").await;
    let (mut bob, bob_id, _) = join(&url, "D", "bob").await;

    send(&mut bob, ClientMessage::Cursor { document_id: "D".into(), position: 1 }).await;
    settle(&mut bob).await;
    send(&mut bob, ClientMessage::Leave { document_id: "D".into() }).await;

    match recv_until(&mut alice, |m| matches!(m, ServerMessage::UserLeft { .. })).await {
        ServerMessage::UserLeft { client_id, .. } => assert_eq!(client_id, bob_id),
        _ => unreachable!(),
    }

    let (_carol, _, snapshot) = join(&url, "D", "carol").await;
    assert!(!snapshot.cursors.contains_key(&bob_id));
    assert!(snapshot.clients.iter().all(|c| c.client_id != bob_id));
}

#[tokio::test]
async fn test_presence_requires_join() {
    let url = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    recv(&mut ws).await;

    send(&mut ws, ClientMessage::Cursor { document_id: "D".into(), position: 0 }).await;
    match recv(&mut ws).await {
        ServerMessage::Error { .. } => {}
        other => panic!("expected error, got {other:?}"),
    }
}
