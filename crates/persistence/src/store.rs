//! Raw string key-value stores.
//!
//! Backends model browser `localStorage`: string keys, string values, a byte
//! quota and no multi-key transactions. Cloning a backend shares its storage.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by a raw store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend cannot be used at all (disabled, missing, unreadable).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Writing `key` would exceed the byte quota.
    #[error("storage quota exceeded writing {key}: {required} bytes needed, quota {quota}")]
    QuotaExceeded {
        key: String,
        required: u64,
        quota: u64,
    },
    #[error("storage lock poisoned during {0}")]
    LockPoisoned(&'static str),
    /// Backing file could not be read or written.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A flat string key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`, returning the previous value.
    fn remove(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// All keys in ascending order.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Bytes used by keys and values.
    fn size_bytes(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for k in self.keys()? {
            let v = self.get(&k)?.unwrap_or_default();
            total += entry_size(&k, &v);
        }
        Ok(total)
    }

    /// Byte budget, when the backend has one.
    fn quota_bytes(&self) -> Option<u64> {
        None
    }
}

/// Shared handle injected into every component.
pub type SharedStore = Arc<dyn KeyValueStore>;

pub(crate) fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

fn check_quota(
    map: &BTreeMap<String, String>,
    quota: Option<u64>,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let used: u64 = map.iter().map(|(k, v)| entry_size(k, v)).sum();
    let old = map.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
    let required = used - old + entry_size(key, value);
    if required > quota {
        warn!(key, required, quota, "write rejected by quota");
        return Err(StoreError::QuotaExceeded {
            key: key.to_string(),
            required,
            quota,
        });
    }
    Ok(())
}

/// In-memory store backed by `Arc<RwLock<BTreeMap>>`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
    quota: Option<u64>,
    disabled: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects writes pushing usage above `quota` bytes.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Store pre-filled with `entries`, ignoring any quota.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(map)),
            ..Self::default()
        }
    }

    /// Simulate the browser disabling storage (private mode, revoked permission).
    pub fn set_available(&self, available: bool) {
        self.disabled.store(!available, Ordering::SeqCst);
    }

    /// Copy of every entry.
    pub fn entries(&self) -> Result<BTreeMap<String, String>, StoreError> {
        self.check_available()?;
        let map = self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned("memory read"))?;
        Ok(map.clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage disabled".into()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let map = self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned("memory read"))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut map = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned("memory write"))?;
        check_quota(&map, self.quota, key, value)?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut map = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned("memory write"))?;
        Ok(map.remove(key))
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let map = self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned("memory read"))?;
        Ok(map.keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.check_available()?;
        let mut map = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned("memory write"))?;
        map.clear();
        Ok(())
    }

    fn size_bytes(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let map = self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned("memory read"))?;
        Ok(map.iter().map(|(k, v)| entry_size(k, v)).sum())
    }

    fn quota_bytes(&self) -> Option<u64> {
        self.quota
    }
}

/// File-backed store: one JSON object, rewritten after every mutation.
///
/// Survives process restarts the way `localStorage` survives a page reload.
#[derive(Clone)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Open `path`, creating parent directories. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P, quota: Option<u64>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let entries: BTreeMap<String, String> = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Backend(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        };
        debug!(path = %path.display(), keys = entries.len(), "opened file store");
        let inner = MemoryStore {
            entries: Arc::new(RwLock::new(entries)),
            quota,
            disabled: Arc::new(AtomicBool::new(false)),
        };
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the entries, persist the copy, then commit it.
    ///
    /// The in-memory map only changes once the file has been replaced, so a
    /// failed write leaves memory and disk agreeing on the old contents.
    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.inner.check_available()?;
        let mut map = self
            .inner
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned("file write"))?;
        let mut next = map.clone();
        let out = change(&mut next)?;
        self.flush(&next)?;
        *map = next;
        Ok(out)
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let text =
            serde_json::to_string_pretty(entries).map_err(|e| StoreError::Backend(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|e| StoreError::Backend(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let quota = self.inner.quota;
        self.mutate(|map| {
            check_quota(map, quota, key, value)?;
            map.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.inner.get(key)?.is_none() {
            return Ok(None);
        }
        self.mutate(|map| Ok(map.remove(key)))
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.mutate(|map| {
            map.clear();
            Ok(())
        })
    }

    fn size_bytes(&self) -> Result<u64, StoreError> {
        self.inner.size_bytes()
    }

    fn quota_bytes(&self) -> Option<u64> {
        self.inner.quota_bytes()
    }
}
