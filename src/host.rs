//! The host capability adapter.
//!
//! Everything the engine needs from the surrounding chat application goes
//! through [`HostBridge`]: whether its settings store is hydrated, our
//! namespaced bucket inside it, the active conversation, the flush primitive,
//! and the UI surface (notices, confirmations, layout).

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::document::{lock, new_shared, Document, SharedDocument};
use crate::error::{Result, SettingsError};
use crate::layout::{LayoutPlan, Rect, Viewport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

pub trait HostBridge: Send + Sync {
    /// Whether the host's settings store exists at all yet.
    fn settings_store_available(&self) -> bool;

    /// Our namespaced bucket, if the host has one.
    fn settings_bucket(&self) -> Option<SharedDocument>;

    /// The bucket, created empty when missing.
    fn ensure_settings_bucket(&self) -> SharedDocument;

    /// Ask the host to write its settings to disk.
    /// [`SettingsError::HostNotReady`] means the host context is not up yet.
    fn request_flush(&self) -> Result<()>;

    fn active_conversation_id(&self) -> Option<String>;

    fn notify(&self, level: NoticeLevel, message: &str);

    /// Ask the user to confirm a destructive action.
    fn confirm(&self, prompt: &str) -> bool;

    fn viewport(&self) -> Option<Viewport>;

    fn element_rect(&self, id: &str) -> Option<Rect>;

    fn apply_layout(&self, plan: &LayoutPlan);
}

/// In-process host. Backs the test-suite and embedders that manage the
/// settings object themselves.
pub struct MemoryHost {
    store_available: AtomicBool,
    context_ready: AtomicBool,
    bucket: Mutex<Option<SharedDocument>>,
    conversation: Mutex<Option<String>>,
    flushes: AtomicUsize,
    notices: Mutex<Vec<(NoticeLevel, String)>>,
    confirm_answer: AtomicBool,
    viewport: Mutex<Option<Viewport>>,
    rects: Mutex<Vec<(String, Rect)>>,
    layouts: Mutex<Vec<LayoutPlan>>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self {
            store_available: AtomicBool::new(false),
            context_ready: AtomicBool::new(false),
            bucket: Mutex::new(None),
            conversation: Mutex::new(None),
            flushes: AtomicUsize::new(0),
            notices: Mutex::new(Vec::new()),
            confirm_answer: AtomicBool::new(true),
            viewport: Mutex::new(None),
            rects: Mutex::new(Vec::new()),
            layouts: Mutex::new(Vec::new()),
        }
    }
}

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl MemoryHost {
    /// A host whose store is still loading.
    pub fn new() -> Self {
        Self::default()
    }

    /// A host that is fully up, with `bucket` as our settings (None = no bucket yet).
    pub fn hydrated(bucket: Option<Document>) -> Self {
        let host = Self::default();
        host.hydrate(bucket);
        host
    }

    /// Simulate the host finishing its own settings load.
    pub fn hydrate(&self, bucket: Option<Document>) {
        *guard(&self.bucket) = bucket.map(new_shared);
        self.store_available.store(true, Ordering::SeqCst);
        self.context_ready.store(true, Ordering::SeqCst);
    }

    pub fn set_context_ready(&self, ready: bool) {
        self.context_ready.store(ready, Ordering::SeqCst);
    }

    /// Simulate the host wiping our bucket contents behind our back.
    pub fn clear_bucket(&self) {
        if let Some(bucket) = guard(&self.bucket).as_ref() {
            lock(bucket).clear();
        }
    }

    pub fn set_conversation(&self, id: Option<&str>) {
        *guard(&self.conversation) = id.map(str::to_string);
    }

    pub fn set_confirm_answer(&self, answer: bool) {
        self.confirm_answer.store(answer, Ordering::SeqCst);
    }

    pub fn set_viewport(&self, viewport: Option<Viewport>) {
        *guard(&self.viewport) = viewport;
    }

    pub fn set_element_rect(&self, id: &str, rect: Rect) {
        let mut rects = guard(&self.rects);
        rects.retain(|(k, _)| k != id);
        rects.push((id.to_string(), rect));
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn notices(&self) -> Vec<(NoticeLevel, String)> {
        guard(&self.notices).clone()
    }

    pub fn layouts(&self) -> Vec<LayoutPlan> {
        guard(&self.layouts).clone()
    }

    /// Copy of the bucket contents, if any.
    pub fn bucket_snapshot(&self) -> Option<Document> {
        guard(&self.bucket).as_ref().map(|b| lock(b).clone())
    }
}

impl HostBridge for MemoryHost {
    fn settings_store_available(&self) -> bool {
        self.store_available.load(Ordering::SeqCst)
    }

    fn settings_bucket(&self) -> Option<SharedDocument> {
        if !self.settings_store_available() {
            return None;
        }
        guard(&self.bucket).clone()
    }

    fn ensure_settings_bucket(&self) -> SharedDocument {
        guard(&self.bucket)
            .get_or_insert_with(|| new_shared(Document::new()))
            .clone()
    }

    fn request_flush(&self) -> Result<()> {
        if !self.context_ready.load(Ordering::SeqCst) {
            return Err(SettingsError::HostNotReady);
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn active_conversation_id(&self) -> Option<String> {
        guard(&self.conversation).clone()
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        guard(&self.notices).push((level, message.to_string()));
    }

    fn confirm(&self, _prompt: &str) -> bool {
        self.confirm_answer.load(Ordering::SeqCst)
    }

    fn viewport(&self) -> Option<Viewport> {
        *guard(&self.viewport)
    }

    fn element_rect(&self, id: &str) -> Option<Rect> {
        guard(&self.rects)
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, r)| *r)
    }

    fn apply_layout(&self, plan: &LayoutPlan) {
        guard(&self.layouts).push(plan.clone());
    }
}

/// Host backed by a JSON settings file, used by the command-line tool.
///
/// The file plays the role of the chat application's settings store: our
/// bucket lives at `extension_settings.<extension id>` and everything else in
/// the file is preserved. It is read once at startup (so it is hydrated from
/// the start) and rewritten on every flush.
pub struct FileHost {
    path: PathBuf,
    extension_id: String,
    root: Mutex<Document>,
    bucket: SharedDocument,
    conversation: Option<String>,
    assume_yes: bool,
}

const EXTENSION_SETTINGS: &str = "extension_settings";

impl FileHost {
    pub fn open(
        path: impl Into<PathBuf>,
        extension_id: &str,
        conversation: Option<String>,
        assume_yes: bool,
    ) -> Self {
        let path = path.into();
        let mut root = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Document>(&content).unwrap_or_else(|e| {
                tracing::warn!("settings file {} is unreadable: {e}", path.display());
                Document::new()
            }),
            Err(_) => Document::new(),
        };
        let bucket = root
            .get_mut(EXTENSION_SETTINGS)
            .and_then(Value::as_object_mut)
            .and_then(|all| all.remove(extension_id))
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        Self {
            path,
            extension_id: extension_id.to_string(),
            root: Mutex::new(root),
            bucket: new_shared(bucket),
            conversation,
            assume_yes,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl HostBridge for FileHost {
    fn settings_store_available(&self) -> bool {
        true
    }

    fn settings_bucket(&self) -> Option<SharedDocument> {
        Some(self.bucket.clone())
    }

    fn ensure_settings_bucket(&self) -> SharedDocument {
        self.bucket.clone()
    }

    fn request_flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut root = guard(&self.root).clone();
        let all = root
            .entry(EXTENSION_SETTINGS)
            .or_insert_with(|| Value::Object(Map::new()));
        if !all.is_object() {
            *all = Value::Object(Map::new());
        }
        if let Value::Object(all) = all {
            all.insert(
                self.extension_id.clone(),
                Value::Object(lock(&self.bucket).clone()),
            );
        }
        let json = serde_json::to_string_pretty(&root)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn active_conversation_id(&self) -> Option<String> {
        self.conversation.clone()
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Error | NoticeLevel::Warning => eprintln!("{message}"),
            NoticeLevel::Info | NoticeLevel::Success => println!("{message}"),
        }
    }

    fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        print!("{prompt} [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }

    fn viewport(&self) -> Option<Viewport> {
        None
    }

    fn element_rect(&self, _id: &str) -> Option<Rect> {
        None
    }

    fn apply_layout(&self, _plan: &LayoutPlan) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_host_lifecycle() {
        let host = MemoryHost::new();
        assert!(!host.settings_store_available());
        assert!(host.settings_bucket().is_none());
        assert!(matches!(host.request_flush(), Err(SettingsError::HostNotReady)));

        host.hydrate(None);
        assert!(host.settings_bucket().is_none());
        let bucket = host.ensure_settings_bucket();
        lock(&bucket).insert("k".into(), json!(1));
        assert_eq!(host.bucket_snapshot().unwrap()["k"], json!(1));
        host.request_flush().unwrap();
        assert_eq!(host.flush_count(), 1);
    }

    #[test]
    fn test_file_host_keeps_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            json!({
                "theme": "dark",
                "extension_settings": {"other": {"x": 1}, "uie": {"diary": {"a": "b"}}}
            })
            .to_string(),
        )
        .unwrap();

        let host = FileHost::open(&path, "uie", None, true);
        let bucket = host.settings_bucket().unwrap();
        assert_eq!(lock(&bucket)["diary"]["a"], json!("b"));
        lock(&bucket).insert("xp".into(), json!(5));
        host.request_flush().unwrap();

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["theme"], json!("dark"));
        assert_eq!(saved["extension_settings"]["other"]["x"], json!(1));
        assert_eq!(saved["extension_settings"]["uie"]["xp"], json!(5));
    }
}
