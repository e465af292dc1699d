// src/checkpoint/mod.rs

//! Per-channel read positions.
//!
//! A checkpoint records the last record number confirmed by the sink. It is
//! written after each delivered batch and read once when a subscription opens.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::config::model::StorageConfig;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub channel: String,
    pub record_id: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn now(channel: impl Into<String>, record_id: u64) -> Self {
        Checkpoint { channel: channel.into(), record_id, updated_at: Utc::now() }
    }
}

/// Durable key/value store of checkpoints, keyed by channel name.
pub trait PositionStore: Send + Sync {
    fn load(&self, channel: &str) -> Result<Option<Checkpoint>, StoreError>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("record number {0} does not fit the store")]
    OutOfRange(u64),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Open the store described by `[storage]`; relative paths are resolved
/// against `base_dir`. No path means an in-memory store.
pub fn open_store(base_dir: &Path, cfg: &StorageConfig) -> Result<Arc<dyn PositionStore>, StoreError> {
    match &cfg.path {
        Some(path) => Ok(Arc::new(SqliteStore::open(&base_dir.join(path))?)),
        None => {
            log::info!("No [storage] path configured; checkpoints are kept in memory");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

/// Process-local store; positions are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl PositionStore for MemoryStore {
    fn load(&self, channel: &str) -> Result<Option<Checkpoint>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(channel).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(checkpoint.channel.clone(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_keys_by_channel() {
        let store = MemoryStore::default();
        assert!(store.load("Application").unwrap().is_none());

        store.save(&Checkpoint::now("Application", 5)).unwrap();
        store.save(&Checkpoint::now("System", 9)).unwrap();
        store.save(&Checkpoint::now("Application", 7)).unwrap();

        assert_eq!(store.load("Application").unwrap().unwrap().record_id, 7);
        assert_eq!(store.load("System").unwrap().unwrap().record_id, 9);
    }

    #[test]
    fn open_store_without_path_is_in_memory() {
        let store = open_store(Path::new("."), &StorageConfig::default()).unwrap();
        store.save(&Checkpoint::now("x", 1)).unwrap();
        assert_eq!(store.load("x").unwrap().map(|c| c.record_id), Some(1));
    }
}
