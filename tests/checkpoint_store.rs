// tests/checkpoint_store.rs

//! SQLite checkpoint store against real files.

use chrono::Utc;
use eventlog_receiver::{
    checkpoint::{Checkpoint, PositionStore, SqliteStore, open_store},
    config::model::StorageConfig,
};
use std::path::PathBuf;
use tempfile::tempdir;

#[test]
fn positions_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store.save(&Checkpoint::now("Application", 120)).unwrap();
        store.save(&Checkpoint::now("System", 7)).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let app = store.load("Application").unwrap().unwrap();
    assert_eq!(app.record_id, 120);
    assert!(app.updated_at <= Utc::now());
    assert_eq!(store.load("System").unwrap().unwrap().record_id, 7);
    assert!(store.load("Security").unwrap().is_none());
}

#[test]
fn timestamps_keep_microseconds() {
    let dir = tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("cp.db")).unwrap();
    let cp = Checkpoint::now("Application", 1);
    store.save(&cp).unwrap();

    let loaded = store.load("Application").unwrap().unwrap();
    assert_eq!(loaded.updated_at.timestamp_micros(), cp.updated_at.timestamp_micros());
}

#[test]
fn relative_storage_path_resolves_against_base_dir() {
    let dir = tempdir().unwrap();
    let cfg = StorageConfig { path: Some(PathBuf::from("state/checkpoints.db")) };

    let store = open_store(dir.path(), &cfg).unwrap();
    store.save(&Checkpoint::now("Application", 3)).unwrap();
    assert!(dir.path().join("state/checkpoints.db").exists());
}

#[test]
fn two_connections_share_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let a = SqliteStore::open(&path).unwrap();
    let b = SqliteStore::open(&path).unwrap();

    a.save(&Checkpoint::now("Application", 10)).unwrap();
    assert_eq!(b.load("Application").unwrap().map(|c| c.record_id), Some(10));
    b.save(&Checkpoint::now("Application", 11)).unwrap();
    assert_eq!(a.load("Application").unwrap().map(|c| c.record_id), Some(11));
}
