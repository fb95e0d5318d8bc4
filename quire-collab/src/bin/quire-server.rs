//! Collaboration server binary.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]);
//! `RUST_LOG` controls log output.

use quire_collab::{RocksStore, ServerConfig, StoreConfig, SyncServer};
use quire_core::VersionGraphStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match config.storage_path.clone() {
        Some(path) => {
            let store = RocksStore::open(StoreConfig { path, ..StoreConfig::default() })?;
            log::info!("Persisting to {}", store.path().display());
            let graph = Arc::new(VersionGraphStore::new(Arc::new(store)));
            SyncServer::new(config, graph).run().await
        }
        None => {
            log::warn!("QUIRE_STORAGE_PATH not set, documents live in memory only");
            SyncServer::in_memory(config).run().await
        }
    }
}
