//! Storage Module
//!
//! File-backed key-value store shared with the host's login flow. Each key
//! is one JSON file; writes go through a temp file and rename so a reader
//! always sees a complete value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Local key-value store
pub struct KeyValueStore {
    storage_path: PathBuf,
}

impl KeyValueStore {
    /// Store under the platform's local data directory
    pub fn new() -> Self {
        let storage_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("CareTracker");
        Self::with_root(storage_path)
    }

    /// Store rooted at an explicit directory
    pub fn with_root(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Key-value store initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    pub fn root(&self) -> &Path {
        &self.storage_path
    }

    /// Save a value under `key`
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json = serde_json::to_vec(data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let file_path = self.path_for(key);
        let tmp_path = file_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &file_path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        info!("Saved data for key: {}", key);
        Ok(())
    }

    /// Load the value stored under `key`
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, StorageError> {
        let file_path = self.path_for(key);

        let bytes = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.path_for(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path)
                .map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    /// Check if key exists
    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.json", key))
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No value stored for key: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
