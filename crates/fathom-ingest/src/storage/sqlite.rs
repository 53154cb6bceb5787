//! SQLite-backed data point storage.
//!
//! One append-only table. Local identity is the auto-incrementing row id,
//! assigned by SQLite at insert time; `created_at` is audit-only wall
//! clock. There is deliberately no uniqueness constraint on `source_id`
//! or `received`: the phase boundary between backfill and live streaming
//! can write the same observation twice, and readers that need uniqueness
//! dedupe downstream.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

use fathom_core::{DataPoint, NewDataPoint, Timestamp};

use super::DataStore;
use crate::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS datapoints (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP NOT NULL,
    source_id  TEXT NOT NULL,
    received   TEXT NOT NULL,
    payload    TEXT
);
"#;

const INSERT_SQL: &str = "INSERT INTO datapoints (source_id, received, payload) VALUES (?1, ?2, ?3)";

/// SQLite storage for data points.
///
/// The connection is mutex-guarded; `Option` lets [`DataStore::close`]
/// consume it while staying idempotent.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            tracing::info!(
                "Found existing database '{}', using as persistent storage",
                path.display()
            );
        } else {
            tracing::info!(
                "Creating new database '{}' for persistent storage",
                path.display()
            );
        }

        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::StorageClosed)?;
        f(conn)
    }
}

impl DataStore for SqliteStore {
    fn init(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<DataPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, source_id, received, payload
                 FROM datapoints ORDER BY id DESC LIMIT ?1",
            )?;

            let rows = stmt.query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;

            let mut points = Vec::new();
            for row in rows {
                let (id, created_at, source_id, received, payload) = row?;
                points.push(DataPoint {
                    id,
                    created_at,
                    source_id,
                    received: Timestamp::parse(&received)?,
                    payload,
                });
            }
            Ok(points)
        })
    }

    fn add(&self, point: &NewDataPoint) -> Result<i64> {
        let id = self.with_conn(|conn| {
            conn.execute(
                INSERT_SQL,
                params![point.source_id, point.received.to_string(), point.payload],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        metrics::counter!("store_writes_total", "mode" => "single").increment(1);
        Ok(id)
    }

    fn add_batch(&self, points: &[NewDataPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(Error::StorageClosed)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_SQL)?;
            for point in points {
                stmt.execute(params![
                    point.source_id,
                    point.received.to_string(),
                    point.payload
                ])?;
            }
        }
        tx.commit()?;

        metrics::counter!("store_writes_total", "mode" => "batch").increment(points.len() as u64);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_conn, e)| Error::Sqlite(e))?;
            tracing::debug!("data store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(source_id: &str, received: i64) -> NewDataPoint {
        NewDataPoint {
            source_id: source_id.to_string(),
            received: Timestamp::from_millis(received),
            payload: Some(format!("payload-{received}")),
        }
    }

    fn open_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().unwrap();
        store
    }

    #[test]
    fn test_init_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().unwrap();
        store.init().unwrap();
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.db");

        let store = SqliteStore::open(&path).unwrap();
        store.init().unwrap();
        store.add(&point("a", 1)).unwrap();
        store.close().unwrap();

        // Reopening an existing file sees the persisted rows.
        let store = SqliteStore::open(&path).unwrap();
        store.init().unwrap();
        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].source_id, "a");
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let store = open_store();
        let first = store.add(&point("a", 1)).unwrap();
        let second = store.add(&point("b", 2)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_list_recent_newest_first_with_limit() {
        let store = open_store();
        for i in 1..=5 {
            store.add(&point(&format!("m{i}"), i)).unwrap();
        }

        let recent = store.list_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        let ids: Vec<i64> = recent.iter().map(|p| p.id).collect();
        assert!(ids.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(recent[0].source_id, "m5");
    }

    #[test]
    fn test_add_batch_then_list_recent_returns_all() {
        let store = open_store();
        let batch: Vec<NewDataPoint> = (1..=10).map(|i| point(&format!("m{i}"), i)).collect();
        store.add_batch(&batch).unwrap();

        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent.len(), 10);
        // Newest-first by local identity: the last batch element on top.
        assert_eq!(recent[0].source_id, "m10");
        assert_eq!(recent[9].source_id, "m1");
    }

    #[test]
    fn test_add_batch_empty_is_noop() {
        let store = open_store();
        store.add_batch(&[]).unwrap();
        assert!(store.list_recent(1).unwrap().is_empty());
    }

    #[test]
    fn test_null_payload_roundtrip() {
        let store = open_store();
        store
            .add(&NewDataPoint {
                source_id: "m".to_string(),
                received: Timestamp::from_millis(7),
                payload: None,
            })
            .unwrap();

        let recent = store.list_recent(1).unwrap();
        assert_eq!(recent[0].payload, None);
    }

    #[test]
    fn test_duplicate_received_tokens_are_both_stored() {
        // No uniqueness constraint: the backfill/live phase boundary can
        // legitimately write the same observation twice.
        let store = open_store();
        store.add(&point("same", 100)).unwrap();
        store.add(&point("same", 100)).unwrap();

        let recent = store.list_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].received, recent[1].received);
    }

    #[test]
    fn test_created_at_is_populated() {
        let store = open_store();
        store.add(&point("a", 1)).unwrap();
        let recent = store.list_recent(1).unwrap();
        assert!(!recent[0].created_at.is_empty());
    }

    #[test]
    fn test_close_idempotent() {
        let store = open_store();
        store.close().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_operations_after_close_fail() {
        let store = open_store();
        store.close().unwrap();
        assert!(matches!(
            store.add(&point("a", 1)),
            Err(Error::StorageClosed)
        ));
        assert!(matches!(store.list_recent(1), Err(Error::StorageClosed)));
    }
}
