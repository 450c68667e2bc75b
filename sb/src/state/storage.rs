//! Durable key/value storage behind state persistence
//!
//! The state manager only needs to read, write and remove string documents by
//! key. Hosts plug in whatever durable store they have.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::sync::lock;

/// Errors from durable storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored data under '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Storage quota exceeded: {requested} bytes requested, {limit} allowed")]
    QuotaExceeded { requested: usize, limit: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A durable string key/value store
pub trait StateStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage, shared between clones
///
/// Two managers built over clones of the same `MemoryStorage` see the same
/// documents, which is how tests simulate a page reload.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes once the total stored bytes would exceed `bytes`
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: Arc::default(),
            quota: Some(bytes),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = lock(&self.entries);
        if let Some(limit) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let requested = others + key.len() + value.len();
            if requested > limit {
                return Err(StorageError::QuotaExceeded { requested, limit });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// File-backed storage: one `<key>.json` file per key in a directory
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash never leaves a half-written document behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open or create storage in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!(?dir, "FileStorage::open: opened storage directory");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`
    ///
    /// Bytes outside `[A-Za-z0-9-]` are written as `_xx` hex, so distinct keys
    /// never share a file.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("{}.json", file_name))
    }
}

impl StateStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        debug!(?path, bytes = value.len(), "FileStorage::write");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_storage_shared_between_clones() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();
        storage.write("k", "v").unwrap();
        assert_eq!(clone.read("k").unwrap().as_deref(), Some("v"));
        clone.remove("k").unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_memory_storage_quota() {
        let storage = MemoryStorage::with_quota(10);
        storage.write("k", "12345").unwrap();
        // Overwriting the same key only counts the new value
        storage.write("k", "123456789").unwrap();

        let err = storage.write("k", "1234567890").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { limit: 10, .. }));
        assert_eq!(storage.read("k").unwrap().as_deref(), Some("123456789"));
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FileStorage::open(temp_dir.path().join("nested")).unwrap();

        assert_eq!(storage.read("dashboard-state").unwrap(), None);
        storage.write("dashboard-state", "{\"a\":1}").unwrap();
        assert_eq!(storage.read("dashboard-state").unwrap().as_deref(), Some("{\"a\":1}"));
        assert!(storage.path_for("dashboard-state").exists());

        storage.remove("dashboard-state").unwrap();
        assert_eq!(storage.read("dashboard-state").unwrap(), None);
        // Removing twice is fine
        storage.remove("dashboard-state").unwrap();
    }

    #[test]
    fn test_file_storage_sanitizes_keys() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FileStorage::open(temp_dir.path()).unwrap();
        let path = storage.path_for("../escape/me");
        assert_eq!(path.parent(), Some(temp_dir.path()));
        assert_eq!(path.file_name().unwrap(), "_2e_2e_2fescape_2fme.json");
    }

    #[test]
    fn test_file_storage_keys_never_share_a_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FileStorage::open(temp_dir.path()).unwrap();
        assert_ne!(storage.path_for("a.b"), storage.path_for("a_b"));

        storage.write("a.b", "dot").unwrap();
        storage.write("a_b", "underscore").unwrap();
        assert_eq!(storage.read("a.b").unwrap().as_deref(), Some("dot"));
        assert_eq!(storage.read("a_b").unwrap().as_deref(), Some("underscore"));
    }
}
