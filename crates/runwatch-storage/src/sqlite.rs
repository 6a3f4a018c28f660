use crate::kv::KvStore;
use crate::{StorageError, KV_SCHEMA_VERSION};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed [`KvStore`]. Every key lives inside `namespace`, so several
/// stores can share one database file without seeing each other's entries.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    namespace: String,
    max_entries: Option<usize>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, namespace.into())
    }

    pub fn open_in_memory(namespace: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, namespace.into())
    }

    fn from_connection(conn: Connection, namespace: String) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
            namespace,
            max_entries: None,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Caps the number of entries in this namespace; the oldest writes are
    /// evicted first.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > KV_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: KV_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn()?;
            conn.execute_batch(include_str!("../migrations/0001_kv_store.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_entries WHERE namespace = ?1",
            [&self.namespace],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn evict_overflow(&self, conn: &Connection) -> Result<(), StorageError> {
        let Some(max_entries) = self.max_entries else {
            return Ok(());
        };
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_entries WHERE namespace = ?1",
            [&self.namespace],
            |row| row.get(0),
        )?;
        let overflow = count - max_entries as i64;
        if overflow <= 0 {
            return Ok(());
        }
        conn.execute(
            "
            DELETE FROM kv_entries
            WHERE namespace = ?1 AND key IN (
                SELECT key FROM kv_entries
                WHERE namespace = ?1
                ORDER BY updated_at ASC, rowid ASC
                LIMIT ?2
            )
            ",
            params![self.namespace, overflow],
        )?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO kv_entries (namespace, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value=excluded.value,
                updated_at=excluded.updated_at
            ",
            params![
                self.namespace,
                key,
                value,
                Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        self.evict_overflow(&conn)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1",
            [&self.namespace],
        )?;
        Ok(())
    }
}
