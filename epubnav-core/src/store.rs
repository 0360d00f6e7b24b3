use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

const STORE_FILE: &str = "store.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode store contents: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

/// Process-wide string store. Single-key writes are atomic and the last
/// writer wins; there are no transactions.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

fn footprint<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> usize {
    entries.map(|(k, v)| k.len() + v.len()).sum()
}

fn check_quota(quota: Option<usize>, needed: usize) -> Result<(), StoreError> {
    match quota {
        Some(quota) if needed > quota => Err(StoreError::QuotaExceeded { needed, quota }),
        _ => Ok(()),
    }
}

pub struct MemoryStore {
    inner: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            quota: None,
        }
    }

    /// Limits the summed size of keys and values, in bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let previous = inner.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let needed = footprint(inner.iter()) - previous + key.len() + value.len();
        check_quota(self.quota, needed)?;
        inner.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

/// Keeps every entry in one JSON document, rewritten atomically through a
/// temporary file on each change.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root).map_err(|source| StoreError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = root.join(STORE_FILE);
        let entries = read_entries(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "opened key-value store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            quota: None,
        })
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(entries).map_err(StoreError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(payload.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(io_err)?;
    serde_json::from_str(&buf).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_owned(), value.to_owned());
        check_quota(self.quota, footprint(next.iter()))?;
        self.write_entries(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.write_entries(&next)?;
        *entries = next;
        Ok(())
    }
}
