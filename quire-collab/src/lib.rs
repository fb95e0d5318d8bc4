//! # quire-collab — live collaboration over the quire version graph
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer       │
//! │ (per user)  │     JSON frames    │ (central)        │
//! └──────┬──────┘                    └────────┬─────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌──────────────────┐      ┌───────────────────┐
//! │ replica     │                    │ CollaborationHub │ ◄─── │ VersionGraphStore │
//! │ (content,   │                    │ one session per  │      │ (quire-core)      │
//! │  version)   │                    │ document         │      └─────────┬─────────┘
//! └─────────────┘                    └────────┬─────────┘                │
//!                                             │                          ▼
//!                                     ┌───────┴────────┐         ┌──────────────┐
//!                                     │ SessionChannel │         │ RocksStore   │
//!                                     │ (fan-out)      │         │ (durable)    │
//!                                     └────────────────┘         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol
//! - [`broadcast`] — per-session fan-out with backpressure
//! - [`presence`] — cursors, selections and section locks
//! - [`hub`] — live sessions and their single-writer sequencing
//! - [`server`] — WebSocket server wiring the hub to the version graph
//! - [`client`] — WebSocket client with a local replica per document
//! - [`storage`] — RocksDB durable store

pub mod broadcast;
pub mod client;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{ChannelStats, Outbound, SessionChannel};
pub use client::{ConnectionState, LocalDocument, SyncClient, SyncEvent};
pub use hub::{CollaborationHub, HubConfig, HubError, HubStats, Joined};
pub use presence::{color_for, LockError, Presence};
pub use protocol::{
    ClientId, ClientInfo, ClientMessage, Comment, DocumentSnapshot, ProtocolError, SectionLock,
    ServerMessage, TextRange,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{RocksStore, StoreConfig};
