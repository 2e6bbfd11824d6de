//! Durable storage for chat messages, project snapshots, and version history.
//!
//! All three stores share one Sled embedded database, each using its own
//! named trees. Records are bincode-encoded via serde. Every write is an
//! independent document operation; no transaction ever spans two stores, so
//! a crash between a project update and a version append can leave either
//! side ahead of the other. Callers treat the stores as eventually
//! consistent with each other.

mod messages;
mod projects;
mod versions;

pub use messages::{ChatMessage, MessageStore, SenderKind};
pub use projects::{Project, ProjectStore};
pub use versions::{VersionLog, VersionRecord};

use std::path::Path;
use std::sync::Arc;

use sled::Db;
use thiserror::Error;

/// Errors that can occur during storage operations.
///
/// Persistence-layer unavailability surfaces as `Sled`; the real-time
/// caller decides whether to degrade to broadcast-only.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("stale revision: current is {current}, write carried {provided}")]
    StaleRevision { current: u64, provided: u64 },

    #[error("storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Configuration for the storage layer.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory.
    pub path: String,
    /// Cache size in bytes.
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate).
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/devroom.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

/// Handle to the shared embedded database.
#[derive(Clone)]
pub struct Database {
    db: Arc<Db>,
}

impl Database {
    /// Open or create the database at the configured path.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Open with default configuration.
    pub fn open_default() -> StoreResult<Self> {
        Self::open(&StorageConfig::default())
    }

    pub fn messages(&self) -> StoreResult<MessageStore> {
        MessageStore::open(&self.db)
    }

    pub fn projects(&self) -> StoreResult<ProjectStore> {
        ProjectStore::open(&self.db)
    }

    pub fn versions(&self) -> StoreResult<VersionLog> {
        VersionLog::open(&self.db)
    }

    /// Force flush all pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use tempfile::TempDir;

    /// Open a throwaway database; the TempDir must outlive the handle.
    pub fn temp_database() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config =
            StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        (Database::open(&config).unwrap(), dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_flush() {
        let (db, _dir) = test_util::temp_database();
        assert!(db.flush().is_ok());
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.cache_size, 256 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 500);
    }
}
