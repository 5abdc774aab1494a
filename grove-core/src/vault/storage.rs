//! Persistent key-value storage for vault records.
//!
//! The vault only ever writes ciphertext through [`KeyValueStore`]; secret
//! bytes never reach an implementation in the clear.

// SQLite operations hold the lock for the duration of the statement.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::error::{VaultError, VaultResult};

/// Trait for persistent storage of vault records.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so a vault can be shared across tasks.
pub trait KeyValueStore: Send + Sync {
    /// Retrieves the bytes stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails. A missing key is `Ok(None)`.
    fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, key: &str, value: &[u8]) -> VaultResult<()>;

    /// Removes `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    fn delete(&self, key: &str) -> VaultResult<()>;

    /// Checks whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn exists(&self, key: &str) -> VaultResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// `SQLite`-backed key-value store.
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> VaultResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Creates a store that lives only as long as the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> VaultResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> VaultResult<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS vault_records (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> VaultResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VaultError::Storage(format!("Failed to acquire database lock: {e}")))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM vault_records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> VaultResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO vault_records (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> VaultResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM vault_records WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// In-memory store for tests.
///
/// This implementation is NOT persistent and should only be used in tests.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    data: std::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryKeyValueStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> VaultResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> VaultResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        data.remove(key);
        Ok(())
    }
}
