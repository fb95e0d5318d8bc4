//! quire core: the patch codec, the version graph and its durable store
//! contract.
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │  patch   │◄──│ graph                │──►│ store        │
//! │ diff/    │   │ VersionGraphStore<S> │   │ DurableStore │
//! │ apply    │   │ branches, tags,merge │   │ MemoryStore  │
//! └──────────┘   └──────────────────────┘   └──────────────┘
//! ```
//!
//! The collaboration hub and the network layer live in `quire-collab`.

pub mod error;
pub mod graph;
pub mod patch;
pub mod store;

pub use error::ErrorKind;
pub use graph::{
    Branch, GraphError, GraphEvent, MergeConflict, MergeOutcome, MergeSide, Metadata,
    Resolution, Tag, VersionGraphStore, VersionId, VersionNode,
};
pub use patch::{Patch, PatchError, PatchSet};
pub use store::{DurableStore, MemoryStore, StoreError, WriteBatch};
