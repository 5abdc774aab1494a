//! Error types for the local event cache.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Error type for cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error from `SQLite`.
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// Stored data could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Another writer holds the database. Retried inside the cache.
    #[error("Cache write conflict: {0}")]
    WriteConflict(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::WriteConflict(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = CacheError::Storage("lock poisoned".to_string());
        assert_eq!(err.to_string(), "Storage error: lock poisoned");
    }

    #[test]
    fn busy_maps_to_write_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(CacheError::from(busy), CacheError::WriteConflict(_)));
    }

    #[test]
    fn other_sqlite_errors_map_to_database() {
        let err: CacheError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, CacheError::Database(_)));
    }

    #[test]
    fn json_errors_map_to_invalid_data() {
        let err: CacheError = serde_json::from_str::<Vec<String>>("{").unwrap_err().into();
        assert!(matches!(err, CacheError::InvalidData(_)));
    }
}
