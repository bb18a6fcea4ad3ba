//! Configuration for the deleted blob index
//!
//! Loaded from TOML, e.g.:
//!
//! ```toml
//! db_path = "/var/lib/blobvault/deleted-blobs.redb"
//! browse_page_size = 512
//!
//! [retry]
//! max_attempts = 10
//! initial_backoff_ms = 5
//! max_backoff_ms = 500
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::index::DEFAULT_BROWSE_PAGE_SIZE;
use crate::retry::RetryPolicy;
use crate::store::RedbRecordStoreConfig;

/// Settings for [`StoreDeletedBlobIndex`](crate::StoreDeletedBlobIndex)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Path to the redb database file
    pub db_path: PathBuf,
    /// redb page cache size in bytes
    pub cache_size: usize,
    /// Retry policy for conflicting transactions
    pub retry: RetryPolicy,
    /// Markers fetched per page while browsing
    pub browse_page_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/deleted-blobs.redb"),
            cache_size: RedbRecordStoreConfig::default().cache_size,
            retry: RetryPolicy::default(),
            browse_page_size: DEFAULT_BROWSE_PAGE_SIZE,
        }
    }
}

impl IndexConfig {
    /// Config with a database file at `db_path` and defaults elsewhere
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, StorageError> {
        let config: Self = toml::from_str(s).map_err(|e| StorageError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StorageError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the browse page size
    pub fn with_browse_page_size(mut self, page_size: usize) -> Self {
        self.browse_page_size = page_size;
        self
    }

    /// Check every value is usable
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.browse_page_size == 0 {
            return Err(StorageError::config("browse_page_size must be at least 1"));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(StorageError::config("db_path must not be empty"));
        }
        self.retry.validate()
    }

    /// Store settings derived from this config
    pub fn redb_config(&self) -> RedbRecordStoreConfig {
        RedbRecordStoreConfig {
            db_path: self.db_path.clone(),
            cache_size: self.cache_size,
        }
    }
}
