//! Persistent key/value storage for cached API responses.
//!
//! The cache layer only needs a small string-to-string store. Two backends are
//! provided: a SQLite file for real use, and an in-memory map for tests and
//! ephemeral sessions. Both can enforce a byte quota so the cache's
//! quota-recovery path behaves the same everywhere.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Storage failures surfaced to the cache layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Writing would push the store past its byte quota
    #[error("storage quota exceeded: {used} + {requested} bytes > {quota} bytes")]
    QuotaExceeded { used: u64, requested: u64, quota: u64 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// A synchronous string key/value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys currently stored, in no particular order
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

fn check_quota(quota: Option<u64>, used: u64, requested: u64) -> Result<(), StoreError> {
    match quota {
        Some(quota) if used + requested > quota => Err(StoreError::QuotaExceeded {
            used,
            requested,
            quota,
        }),
        _ => Ok(()),
    }
}

/// In-memory store, optionally bounded by a byte quota
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Bytes currently used by keys and values
    pub fn used_bytes(&self) -> u64 {
        self.lock().iter().map(|(k, v)| entry_size(k, v)).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let used: u64 = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| entry_size(k, v))
            .sum();
        check_quota(self.quota_bytes, used, entry_size(key, value))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}

/// SQLite-backed store holding every pair in a single table
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota_bytes: Option<u64>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>, quota_bytes: Option<u64>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        debug!(path = %path.display(), "Opening cache store");

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache store at {}", path.display()))?;

        Self::with_connection(conn, quota_bytes)
    }

    /// Open a store that lives only as long as this value
    pub fn open_in_memory(quota_bytes: Option<u64>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::with_connection(conn, quota_bytes)
    }

    fn with_connection(conn: Connection, quota_bytes: Option<u64>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("Failed to create kv_store table")?;

        info!(quota_bytes = ?quota_bytes, "Cache store ready");

        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
        })
    }

    /// Bytes currently used by keys and values
    pub fn used_bytes(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        Self::used_bytes_excluding(&conn, "")
    }

    fn used_bytes_excluding(conn: &Connection, key: &str) -> Result<u64, StoreError> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
             FROM kv_store WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as u64)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        if self.quota_bytes.is_some() {
            let used = Self::used_bytes_excluding(&conn, key)?;
            check_quota(self.quota_bytes, used, entry_size(key, value))?;
        }
        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv_store")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}
