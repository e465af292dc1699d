// src/checkpoint/sqlite.rs
//! SQLite-backed checkpoint store (WAL, single connection behind a mutex).

use super::{Checkpoint, PositionStore, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::{
    path::Path,
    sync::{Mutex, PoisonError},
    thread::sleep,
    time::Duration,
};

const UPSERT_SQL: &str = "INSERT INTO checkpoints (channel, record_id, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(channel) DO UPDATE SET record_id = excluded.record_id, updated_at = excluded.updated_at";

const SELECT_SQL: &str = "SELECT record_id, updated_at FROM checkpoints WHERE channel = ?1";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(1_000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(include_str!("../../resources/schema.sql"))?;
        log::info!("Checkpoint store ready at {}", path.display());
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    /// In-memory database with the same schema.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("../../resources/schema.sql"))?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

impl PositionStore for SqliteStore {
    fn load(&self, channel: &str) -> Result<Option<Checkpoint>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let row = conn
            .query_row(SELECT_SQL, params![channel], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })
            .optional()?;

        Ok(row.map(|(record_id, micros)| Checkpoint {
            channel: channel.to_string(),
            record_id: u64::try_from(record_id).unwrap_or_default(),
            updated_at: DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default(),
        }))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let record_id = i64::try_from(checkpoint.record_id)
            .map_err(|_| StoreError::OutOfRange(checkpoint.record_id))?;
        let micros = checkpoint.updated_at.timestamp_micros();
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let mut attempts = 0;
        loop {
            match conn.execute(UPSERT_SQL, params![checkpoint.channel, record_id, micros]) {
                Ok(_) => return Ok(()),
                Err(e) if e.to_string().contains("database is locked") && attempts < 5 => {
                    attempts += 1;
                    sleep(Duration::from_millis(50 * attempts));
                }
                Err(e) => return Err(StoreError::Sql(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_previous_position() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&Checkpoint::now("Application", 10)).unwrap();
        store.save(&Checkpoint::now("Application", 12)).unwrap();
        let cp = store.load("Application").unwrap().unwrap();
        assert_eq!(cp.record_id, 12);
        assert!(store.load("System").unwrap().is_none());
    }

    #[test]
    fn huge_record_numbers_are_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.save(&Checkpoint::now("Application", u64::MAX)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)));
    }
}
