//! RocksDB-backed [`DurableStore`].
//!
//! Column families:
//! - `kv`    — version graph records (LZ4 compressed, keyed by graph key)
//! - `locks` — advisory lock leases (bincode, keyed by lock id)
//!
//! Graph keys are `/`-separated paths (`node/<doc>/<id>`, `branch/<doc>/<name>`)
//! so a document's records sit next to each other and prefix scans are a
//! single forward seek.

use chrono::{DateTime, Utc};
use quire_core::store::BatchOp;
use quire_core::{DurableStore, StoreError, WriteBatch};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const CF_KV: &str = "kv";
const CF_LOCKS: &str = "locks";

const COLUMN_FAMILIES: &[&str] = &[CF_KV, CF_LOCKS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Persisted lock lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn is_live(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().map(|age| age < ttl).unwrap_or(true)
    }
}

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// RocksDB-backed graph store.
///
/// Leases are persisted, so a save lock survives a restart until its TTL
/// runs out.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes lock check-and-set.
    lock_guard: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(backend)?;

        log::info!("Opened store at {}", config.path.display());
        Ok(Self { db, config, lock_guard: Mutex::new(()) })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_KV => {
                // Values are LZ4 framed already.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_LOCKS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn decompress(value: &[u8]) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(value).map_err(|e| StoreError::Compression(e.to_string()))
    }

    fn lock_guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock_guard
            .lock()
            .map_err(|_| StoreError::Backend("lock table mutex poisoned".to_string()))
    }

    /// Holder of lock `id`, if any lease is recorded.
    pub fn lock_owner(&self, id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_LOCKS)?;
        match self.db.get_cf(&cf, id.as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(LockRecord::decode(&bytes)?.owner)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{name}' not found")))
    }
}

impl DurableStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_KV)?;
        match self.db.get_cf(&cf, key.as_bytes()).map_err(backend)? {
            Some(compressed) => Ok(Some(Self::decompress(&compressed)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_KV)?;
        let compressed = lz4_flex::compress_prepend_size(value);
        self.db
            .put_cf_opt(&cf, key.as_bytes(), &compressed, &self.write_options())
            .map_err(backend)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let cf = self.cf(CF_KV)?;
        let ops = batch.len();
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    rocks_batch.put_cf(&cf, key.as_bytes(), lz4_flex::compress_prepend_size(&value));
                }
                BatchOp::Delete { key } => rocks_batch.delete_cf(&cf, key.as_bytes()),
            }
        }
        self.db.write_opt(rocks_batch, &self.write_options()).map_err(backend)?;
        log::trace!("Wrote batch of {ops} ops");
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_KV)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(format!("non-UTF-8 key: {e}")))?;
            entries.push((key, Self::decompress(&value)?));
        }
        Ok(entries)
    }

    fn acquire_lock(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let cf = self.cf(CF_LOCKS)?;
        let _guard = self.lock_guard()?;

        if let Some(bytes) = self.db.get_cf(&cf, id.as_bytes()).map_err(backend)? {
            let current = LockRecord::decode(&bytes)?;
            if current.owner != owner && current.is_live(ttl) {
                log::debug!("Lock {id} held by {}", current.owner);
                return Ok(false);
            }
        }

        let record = LockRecord { owner: owner.to_string(), acquired_at: Utc::now() };
        self.db
            .put_cf_opt(&cf, id.as_bytes(), record.encode()?, &self.write_options())
            .map_err(backend)?;
        Ok(true)
    }

    fn release_lock(&self, id: &str, owner: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_LOCKS)?;
        let _guard = self.lock_guard()?;

        match self.db.get_cf(&cf, id.as_bytes()).map_err(backend)? {
            Some(bytes) if LockRecord::decode(&bytes)?.owner == owner => {
                self.db
                    .delete_cf_opt(&cf, id.as_bytes(), &self.write_options())
                    .map_err(backend)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
