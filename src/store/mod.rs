//! Embedded metadata store.
//!
//! # Responsibilities
//! - Persist long-lived metadata: known services, activity history, and
//!   optional API keys
//! - Stay off the proxy hot path: writes happen on lifecycle edges only
//!
//! In-flight queues are process-local and never persisted.

use std::path::Path;
use std::sync::Mutex;
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// SQLite-backed store guarded by a mutex. All operations are short
/// single-statement transactions.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

/// One persisted activity event.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub service_id: String,
    pub event: String,
    pub detail: String,
    pub at_unix_ms: i64,
}

impl MetadataStore {
    /// Open (or create) the database and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS services (
                id          TEXT PRIMARY KEY,
                first_seen  INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS activity_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id  TEXT NOT NULL,
                event       TEXT NOT NULL,
                detail      TEXT NOT NULL DEFAULT '',
                at_unix_ms  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_service
                ON activity_log (service_id, at_unix_ms);
            CREATE TABLE IF NOT EXISTS api_keys (
                key         TEXT PRIMARY KEY,
                label       TEXT NOT NULL DEFAULT ''
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now_unix_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Make sure a service row exists.
    pub fn register_service(&self, service_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO services (id, first_seen) VALUES (?1, ?2)",
            params![service_id, Self::now_unix_ms()],
        )?;
        Ok(())
    }

    /// Append an activity event for a service.
    pub fn log_activity(&self, service_id: &str, event: &str, detail: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_log (service_id, event, detail, at_unix_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![service_id, event, detail, Self::now_unix_ms()],
        )?;
        Ok(())
    }

    /// Most recent activity, newest first.
    pub fn recent_activity(
        &self,
        service_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT service_id, event, detail, at_unix_ms
             FROM activity_log
             WHERE service_id = ?1
             ORDER BY at_unix_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![service_id, limit as i64], |row| {
            Ok(ActivityRecord {
                service_id: row.get(0)?,
                event: row.get(1)?,
                detail: row.get(2)?,
                at_unix_ms: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Check an API key against the persisted set.
    pub fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM api_keys WHERE key = ?1")?;
        Ok(stmt.exists(params![key])?)
    }

    /// Insert an API key (idempotent).
    pub fn insert_key(&self, key: &str, label: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO api_keys (key, label) VALUES (?1, ?2)",
            params![key, label],
        )?;
        Ok(())
    }
}
