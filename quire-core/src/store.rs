//! Durable store contract and an in-memory implementation.
//!
//! The version graph mirrors every mutation through [`DurableStore`]. Writes
//! belonging to one graph operation go through a single [`WriteBatch`] so a
//! crash never leaves a node without its branch pointer (or the reverse).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::ErrorKind;

/// Durable store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

/// One write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Group of writes that become visible together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-value persistence with advisory locks.
///
/// Implementations must make `put`, `get` and `write_batch` atomic, and
/// `acquire_lock` must return immediately.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Take or refresh the lock `id` for `owner`. Returns `false` when another
    /// owner holds it and its lease is younger than `ttl`.
    fn acquire_lock(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Release `id` if held by `owner`. Returns whether a lock was released.
    fn release_lock(&self, id: &str, owner: &str) -> Result<bool, StoreError>;
}

struct LockLease {
    owner: String,
    acquired_at: Instant,
}

/// Process-local store backed by an ordered map.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    locks: Mutex<HashMap<String, LockLease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend("memory store mutex poisoned".to_string())
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn acquire_lock(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        if let Some(lease) = locks.get(id) {
            if lease.owner != owner && lease.acquired_at.elapsed() < ttl {
                return Ok(false);
            }
        }
        locks.insert(
            id.to_string(),
            LockLease { owner: owner.to_string(), acquired_at: Instant::now() },
        );
        Ok(true)
    }

    fn release_lock(&self, id: &str, owner: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        match locks.get(id) {
            Some(lease) if lease.owner == owner => {
                locks.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
