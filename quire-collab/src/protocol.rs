//! JSON wire protocol between editors and the collaboration server.
//!
//! Every frame is one WebSocket text message holding one JSON object:
//! ```text
//! { "type": "change", "documentId": "D", "patchSet": "@@ -1,4 +1,5 @@\n…", "version": 7 }
//!   └─ kebab-case tag └─ camelCase fields
//! ```
//!
//! Client → server frames are [`ClientMessage`], server → client frames are
//! [`ServerMessage`]. Patch sets travel in their text form (see
//! [`quire_core::PatchSet::to_text`]).

use chrono::{DateTime, Utc};
use quire_core::{ErrorKind, Metadata, VersionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one connection, assigned by the server on accept.
pub type ClientId = Uuid;

/// Half-open char range `[start, end)` in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Connected editor as seen by the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub username: String,
    /// `#rrggbb`, stable per client id.
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub document_id: String,
    pub client_id: ClientId,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<TextRange>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionLock {
    pub section_id: String,
    pub client_id: ClientId,
    pub acquired_at: DateTime<Utc>,
}

/// Full session state sent to a client when it joins or resyncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub content: String,
    pub version: u64,
    pub comments: Vec<Comment>,
    pub cursors: BTreeMap<ClientId, usize>,
    pub selections: BTreeMap<ClientId, TextRange>,
    pub locks: Vec<SectionLock>,
    pub clients: Vec<ClientInfo>,
}

/// Frames sent by editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        document_id: String,
        username: String,
    },
    Leave {
        document_id: String,
    },
    /// `version` is the session version the patch was computed against.
    Change {
        document_id: String,
        patch_set: String,
        version: u64,
    },
    Cursor {
        document_id: String,
        position: usize,
    },
    Selection {
        document_id: String,
        #[serde(default)]
        range: Option<TextRange>,
    },
    Comment {
        document_id: String,
        text: String,
        #[serde(default)]
        anchor: Option<TextRange>,
    },
    CommentRemoved {
        document_id: String,
        comment_id: Uuid,
    },
    LockSection {
        document_id: String,
        section_id: String,
    },
    UnlockSection {
        document_id: String,
        section_id: String,
    },
    /// Persist the live session content as a new version.
    Commit {
        document_id: String,
        #[serde(default)]
        metadata: Metadata,
    },
    SwitchBranch {
        document_id: String,
        branch: String,
    },
    Restore {
        document_id: String,
        version_id: VersionId,
    },
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        client_id: ClientId,
    },
    Document(DocumentSnapshot),
    /// Applied change; `version` is the session version after it.
    /// `client_id` is absent for server-originated changes.
    Change {
        document_id: String,
        patch_set: String,
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },
    SyncRequired {
        document_id: String,
        current_version: u64,
    },
    /// To the submitter only: its change was applied at `version`, but the
    /// listed hunks (zero-based) found no match and were skipped.
    HunksFailed {
        document_id: String,
        version: u64,
        failed_hunks: Vec<usize>,
    },
    Cursor {
        document_id: String,
        client_id: ClientId,
        position: usize,
    },
    Selection {
        document_id: String,
        client_id: ClientId,
        #[serde(default)]
        range: Option<TextRange>,
    },
    Comment {
        document_id: String,
        comment: Comment,
    },
    CommentRemoved {
        document_id: String,
        comment_id: Uuid,
    },
    SectionLocked {
        document_id: String,
        section_id: String,
        client_id: ClientId,
    },
    SectionUnlocked {
        document_id: String,
        section_id: String,
        client_id: ClientId,
    },
    UserJoined {
        document_id: String,
        client_id: ClientId,
        username: String,
        color: String,
    },
    UserLeft {
        document_id: String,
        client_id: ClientId,
    },
    Committed {
        document_id: String,
        version_id: VersionId,
        content_hash: String,
        branch: String,
    },
    BranchSwitched {
        document_id: String,
        branch: String,
        version_id: VersionId,
    },
    Error {
        code: ErrorKind,
        message: String,
    },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode(text)
    }

    /// Document the frame addresses, if any.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { document_id, .. }
            | ClientMessage::Leave { document_id }
            | ClientMessage::Change { document_id, .. }
            | ClientMessage::Cursor { document_id, .. }
            | ClientMessage::Selection { document_id, .. }
            | ClientMessage::Comment { document_id, .. }
            | ClientMessage::CommentRemoved { document_id, .. }
            | ClientMessage::LockSection { document_id, .. }
            | ClientMessage::UnlockSection { document_id, .. }
            | ClientMessage::Commit { document_id, .. }
            | ClientMessage::SwitchBranch { document_id, .. }
            | ClientMessage::Restore { document_id, .. } => Some(document_id),
            ClientMessage::Ping => None,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode(text)
    }

    pub fn error(code: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error { code, message: message.into() }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Document(_) => "document",
            ServerMessage::Change { .. } => "change",
            ServerMessage::SyncRequired { .. } => "sync-required",
            ServerMessage::HunksFailed { .. } => "hunks-failed",
            ServerMessage::Cursor { .. } => "cursor",
            ServerMessage::Selection { .. } => "selection",
            ServerMessage::Comment { .. } => "comment",
            ServerMessage::CommentRemoved { .. } => "comment-removed",
            ServerMessage::SectionLocked { .. } => "section-locked",
            ServerMessage::SectionUnlocked { .. } => "section-unlocked",
            ServerMessage::UserJoined { .. } => "user-joined",
            ServerMessage::UserLeft { .. } => "user-left",
            ServerMessage::Committed { .. } => "committed",
            ServerMessage::BranchSwitched { .. } => "branch-switched",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("binary frames are not supported")]
    UnexpectedBinary,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("document {0} is not open")]
    NotJoined(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Serialization(_) | ProtocolError::ConnectionClosed | ProtocolError::NotConnected => {
                ErrorKind::Storage
            }
            ProtocolError::Deserialization(_) | ProtocolError::UnexpectedBinary | ProtocolError::NotJoined(_) => {
                ErrorKind::InvalidInput
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_wire_shape() {
        let msg = ClientMessage::Change {
            document_id: "D".into(),
            patch_set: "@@ -1 +1 @@\n-a\n+b\n".into(),
            version: 4,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "change",
                "documentId": "D",
                "patchSet": "@@ -1 +1 @@\n-a\n+b\n",
                "version": 4
            })
        );
    }

    #[test]
    fn test_decode_join_from_editor() {
        let msg = ClientMessage::decode(r#"{"type":"join","documentId":"D","username":"alice"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join { document_id: "D".into(), username: "alice".into() }
        );
        assert_eq!(msg.document_id(), Some("D"));
    }

    #[test]
    fn test_sync_required_wire_shape() {
        let msg = ServerMessage::SyncRequired { document_id: "D".into(), current_version: 5 };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "sync-required", "documentId": "D", "currentVersion": 5}));
    }

    #[test]
    fn test_hunks_failed_wire_shape() {
        let msg = ServerMessage::HunksFailed { document_id: "D".into(), version: 3, failed_hunks: vec![1] };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "hunks-failed", "documentId": "D", "version": 3, "failedHunks": [1]})
        );
        assert_eq!(msg.kind(), "hunks-failed");
    }

    #[test]
    fn test_document_snapshot_is_flat() {
        let client = Uuid::new_v4();
        let mut cursors = BTreeMap::new();
        cursors.insert(client, 3);
        let msg = ServerMessage::Document(DocumentSnapshot {
            document_id: "D".into(),
            content: "Hello".into(),
            version: 2,
            comments: Vec::new(),
            cursors,
            selections: BTreeMap::new(),
            locks: Vec::new(),
            clients: Vec::new(),
        });
        let text = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "document");
        assert_eq!(value["content"], "Hello");
        assert_eq!(value["cursors"][client.to_string()], 3);
        assert_eq!(ServerMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_error_code_uses_kind() {
        let msg = ServerMessage::error(ErrorKind::LockHeld, "section s1 is locked");
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "lock-held");
    }

    #[test]
    fn test_optional_fields_default() {
        let msg = ClientMessage::decode(r#"{"type":"commit","documentId":"D"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Commit { document_id: "D".into(), metadata: Metadata::new() });

        let msg = ClientMessage::decode(r#"{"type":"selection","documentId":"D"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Selection { document_id: "D".into(), range: None });
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(ClientMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(ServerMessage::decode(r#"{"type":"pong"}"#).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            ClientMessage::decode("{not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ClientMessage::decode(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_message_kind_matches_tag() {
        let msg = ServerMessage::UserLeft { document_id: "D".into(), client_id: Uuid::new_v4() };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], msg.kind());
    }
}
