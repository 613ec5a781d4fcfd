use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;

use crate::error::{Result, SettingsError};

/// Asynchronous record store organised in named collections.
/// `put` fully replaces the record stored under `id`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;
    async fn keys(&self, collection: &str) -> Result<Vec<String>>;
    async fn get_all(&self, collection: &str) -> Result<Vec<Value>>;
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()>;
}

/// In-process store. Counts writes and can be switched off, for tests and
/// for hosts without any durable storage.
#[derive(Default)]
pub struct MemoryDurableStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    disabled: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    /// Number of `put` calls accepted so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(SettingsError::StorageUnavailable("durable store disabled".into()));
        }
        Ok(())
    }

    fn collections(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Value>>> {
        self.collections.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.collections()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.check()?;
        Ok(self
            .collections()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .collections()
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        self.check()?;
        Ok(self
            .collections()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.check()?;
        if let Some(c) = self.collections().get_mut(collection) {
            for id in ids {
                c.remove(id);
            }
        }
        Ok(())
    }
}

/// Records as pretty JSON files: `<root>/<collection>/<id>.json`.
pub struct FileDurableStore {
    root: PathBuf,
}

impl FileDurableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(sanitize_component(collection))
    }

    fn record_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", sanitize_component(id)))
    }
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        let dir = self.collection_dir(collection);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.record_path(collection, id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let path = self.record_path(collection, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.collection_dir(collection)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                keys.push(id.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let keys = self.keys(collection).await?;
        let reads = keys.iter().map(|id| self.get(collection, id));
        let mut records = Vec::new();
        for result in join_all(reads).await {
            match result {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                // One corrupt record must not hide the rest of the ring.
                Err(e) => tracing::warn!("skipping unreadable {collection} record: {e}"),
            }
        }
        Ok(records)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            match tokio::fs::remove_file(self.record_path(collection, id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
