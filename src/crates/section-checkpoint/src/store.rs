//! Capacity-aware key-value storage
//!
//! [`KeyStore`] wraps a synchronous, origin-scoped [`StorageBackend`] (a
//! `localStorage`-like map of string keys to string values) and is the only
//! resource shared between writers and restore coordinators.
//!
//! # Availability
//!
//! The backend is probed once when the store is opened by writing and removing
//! a sentinel key. A backend that fails the probe (storage disabled, private
//! mode, broken disk) turns every later call into a no-op, so the engine
//! degrades to "no persistence" instead of failing the session.
//!
//! # Eviction accounting
//!
//! The store keeps a logical access clock per key. Reads and writes touch the
//! key; [`KeyStore::eviction_candidates`] lists keys least recently used first.
//! Keys never touched in this session sort before every touched key.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ KeyStore                                    │
//! │   available: bool   (probed once)           │
//! │   clock: u64        (bumped per touch)      │
//! │   touched: key -> tick                      │
//! │        │                                    │
//! │        ▼                                    │
//! │   Arc<dyn StorageBackend>                   │
//! │     ├─ MemoryBackend (quota, disabled)      │
//! │     └─ FileBackend   (JSON file on disk)    │
//! └────────────────────────────────────────────┘
//! ```

use crate::error::{CheckpointError, Result};
use crate::namespace::CURRENT_SECTION_KEY;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Sentinel written and removed when probing a backend
pub const PROBE_KEY: &str = "__section_checkpoint_probe__";

/// Errors reported by a storage backend
#[derive(Error, Debug)]
pub enum BackendError {
    /// The write would exceed the backend's capacity
    #[error("quota exceeded")]
    QuotaExceeded,

    /// The backend cannot be used at all
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// A synchronous string key-value store
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> std::result::Result<Option<String>, BackendError>;

    fn set_item(&self, key: &str, value: &str) -> std::result::Result<(), BackendError>;

    fn remove_item(&self, key: &str) -> std::result::Result<(), BackendError>;

    /// All keys currently stored, in no particular order
    fn keys(&self) -> std::result::Result<Vec<String>, BackendError>;
}

/// In-process backend with an optional byte quota
///
/// Quota accounting counts the UTF-8 length of keys plus values, the way
/// browsers bound `localStorage`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    items: Arc<Mutex<HashMap<String, String>>>,
    quota_bytes: Option<usize>,
    disabled: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects writes once keys plus values exceed `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Backend that fails every call, like a profile with storage turned off
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Raw copy of the stored items (useful for tests)
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.items.lock().clone()
    }

    fn check_enabled(&self) -> std::result::Result<(), BackendError> {
        if self.disabled {
            Err(BackendError::Unavailable("storage disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn get_item(&self, key: &str) -> std::result::Result<Option<String>, BackendError> {
        self.check_enabled()?;
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> std::result::Result<(), BackendError> {
        self.check_enabled()?;
        let mut items = self.items.lock();

        if let Some(quota) = self.quota_bytes {
            let used: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(BackendError::QuotaExceeded);
            }
        }

        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> std::result::Result<(), BackendError> {
        self.check_enabled()?;
        self.items.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> std::result::Result<Vec<String>, BackendError> {
        self.check_enabled()?;
        Ok(self.items.lock().keys().cloned().collect())
    }
}

/// Durable backend persisting all items as one JSON object on disk
///
/// Every mutation rewrites the file through a temporary sibling and a rename,
/// so a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileBackend {
    /// Open (or create on first write) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let items = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Storage file unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CheckpointError::Io(e)),
        };

        debug!(path = %path.display(), items = items.len(), "Opened file storage backend");
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> std::result::Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(items)?).map_err(|e| {
            if is_disk_full(&e) {
                BackendError::QuotaExceeded
            } else {
                BackendError::Io(e)
            }
        })?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn is_disk_full(err: &std::io::Error) -> bool {
    // ENOSPC / EDQUOT
    matches!(err.raw_os_error(), Some(28) | Some(122))
}

impl StorageBackend for FileBackend {
    fn get_item(&self, key: &str) -> std::result::Result<Option<String>, BackendError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> std::result::Result<(), BackendError> {
        let mut items = self.items.lock();
        let previous = items.insert(key.to_string(), value.to_string());

        if let Err(e) = self.persist(&items) {
            match previous {
                Some(old) => items.insert(key.to_string(), old),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> std::result::Result<(), BackendError> {
        let mut items = self.items.lock();
        let Some(previous) = items.remove(key) else {
            return Ok(());
        };

        if let Err(e) = self.persist(&items) {
            items.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self) -> std::result::Result<Vec<String>, BackendError> {
        Ok(self.items.lock().keys().cloned().collect())
    }
}

/// Availability-probed, LRU-accounted wrapper over a [`StorageBackend`]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
    available: bool,
    clock: AtomicU64,
    touched: Mutex<HashMap<String, u64>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("available", &self.available)
            .field("tracked_keys", &self.touched.lock().len())
            .finish()
    }
}

impl KeyStore {
    /// Wrap `backend`, probing it once for availability
    pub fn open(backend: Arc<dyn StorageBackend>) -> Self {
        let available = match probe(backend.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Storage unavailable, checkpoints disabled for this session");
                false
            }
        };

        Self {
            backend,
            available,
            clock: AtomicU64::new(0),
            touched: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the availability probe succeeded
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Read a value; backend failures read as absent
    pub fn get(&self, key: &str) -> Option<String> {
        if !self.available {
            return None;
        }

        match self.backend.get_item(key) {
            Ok(Some(value)) => {
                self.touch(key);
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Storage read failed");
                None
            }
        }
    }

    /// Write a value in one backend call
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if !self.available {
            return Err(CheckpointError::StorageUnavailable);
        }

        match self.backend.set_item(key, value) {
            Ok(()) => {
                self.touch(key);
                Ok(())
            }
            Err(BackendError::QuotaExceeded) => Err(CheckpointError::StorageFull {
                key: key.to_string(),
            }),
            Err(BackendError::Unavailable(_)) => Err(CheckpointError::StorageUnavailable),
            Err(e) => Err(CheckpointError::Backend(e.to_string())),
        }
    }

    /// Remove a value; failures are logged and otherwise ignored
    pub fn remove(&self, key: &str) {
        if !self.available {
            return;
        }

        if let Err(e) = self.backend.remove_item(key) {
            warn!(key, error = %e, "Storage remove failed");
        }
        self.touched.lock().remove(key);
    }

    /// Every stored key
    pub fn keys(&self) -> Vec<String> {
        if !self.available {
            return Vec::new();
        }

        self.backend.keys().unwrap_or_else(|e| {
            warn!(error = %e, "Storage key enumeration failed");
            Vec::new()
        })
    }

    /// Stored keys ordered least recently used first, skipping the
    /// cross-section key, the probe sentinel and anything `protect` accepts
    pub fn eviction_candidates(&self, protect: impl Fn(&str) -> bool) -> Vec<String> {
        let touched = self.touched.lock().clone();

        let mut candidates: Vec<(u64, String)> = self
            .keys()
            .into_iter()
            .filter(|key| key != CURRENT_SECTION_KEY && key != PROBE_KEY && !protect(key))
            .map(|key| (touched.get(&key).copied().unwrap_or(0), key))
            .collect();

        candidates.sort();
        candidates.into_iter().map(|(_, key)| key).collect()
    }

    fn touch(&self, key: &str) {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.touched.lock().insert(key.to_string(), tick);
    }
}

fn probe(backend: &dyn StorageBackend) -> std::result::Result<(), BackendError> {
    backend.set_item(PROBE_KEY, PROBE_KEY)?;
    backend.remove_item(PROBE_KEY)
}
