use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::document::{is_non_empty_object, Document};
use crate::error::{Result, SettingsError};

/// Synchronous string key-value store with a byte quota.
pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    /// Fails with [`SettingsError::QuotaExceeded`] when the value does not fit.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str);
}

/// In-process storage. Can be disabled to simulate a blocked browser store.
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: usize,
    disabled: AtomicBool,
}

impl MemoryStorage {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            quota_bytes,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl LocalStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        if self.disabled.load(Ordering::SeqCst) {
            return None;
        }
        self.items().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(SettingsError::StorageUnavailable("local storage disabled".into()));
        }
        let mut items = self.items();
        let used: usize = items
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if used + key.len() + value.len() > self.quota_bytes {
            return Err(SettingsError::QuotaExceeded);
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.items().remove(key);
    }
}

/// One file per key inside a directory; the quota covers the whole directory.
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: usize,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(safe)
    }

    fn used_bytes(&self, except: &Path) -> usize {
        std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.path() != except)
            // Leftovers of an interrupted write are not stored values.
            .filter(|e| e.path().extension().map_or(true, |ext| ext != "tmp"))
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len() as usize)
            .sum()
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SettingsError::StorageUnavailable(e.to_string()))?;
        let path = self.path_for(key);
        if self.used_bytes(&path) + value.len() > self.quota_bytes {
            return Err(SettingsError::QuotaExceeded);
        }
        // Write-then-rename so a crash never leaves a torn snapshot.
        let tmp = path.with_extension("tmp");
        let written = std::fs::write(&tmp, value).and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}

/// A timestamped copy of the settings document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorSnapshot {
    #[serde(alias = "timestamp", default)]
    pub at: u64,
    #[serde(default)]
    pub data: Document,
}

/// The fast local cache: one snapshot under one fixed key.
pub struct FastLocalCache {
    storage: Arc<dyn LocalStorage>,
    key: String,
}

impl FastLocalCache {
    pub fn new(storage: Arc<dyn LocalStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    pub fn write(&self, snapshot: &MirrorSnapshot) -> Result<()> {
        let raw = serde_json::to_string(snapshot)?;
        self.storage.set_item(&self.key, &raw)
    }

    /// The stored snapshot, or `None` when the slot is missing or unparsable.
    pub fn read(&self) -> Option<MirrorSnapshot> {
        let raw = self.storage.get_item(&self.key)?;
        match serde_json::from_str::<MirrorSnapshot>(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!("ignoring unparsable mirror slot: {e}");
                None
            }
        }
    }

    /// Cheap probe: does the slot hold a non-empty document?
    pub fn has_non_empty(&self) -> bool {
        let Some(raw) = self.storage.get_item(&self.key) else {
            return false;
        };
        serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.get("data").map(is_non_empty_object))
            .unwrap_or(false)
    }
}
