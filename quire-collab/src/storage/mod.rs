//! Persistent storage for the version graph.
//!
//! ```text
//! ┌────────────────────┐   WriteBatch    ┌──────────────┐
//! │ VersionGraphStore  │ ──────────────► │ RocksStore   │
//! │ (in-memory graph)  │                 │ (RocksDB)    │
//! └─────────┬──────────┘                 └──────┬───────┘
//!           │ lazy load per document            │ column families
//!           ▼                                   ▼
//!    scan_prefix("node/<doc>/")   ┌──────────────────────────────┐
//!                                 │ CF "kv"    — graph records   │
//!                                 │ CF "locks" — save leases     │
//!                                 └──────────────────────────────┘
//! ```
//!
//! Any [`quire_core::DurableStore`] works; [`quire_core::MemoryStore`] is the
//! choice when no storage path is configured.

pub mod rocks;

pub use rocks::{RocksStore, StoreConfig};
