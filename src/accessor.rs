//! The single entry point to the settings document.
//!
//! Before the host has hydrated its settings store we hand out a bootstrap
//! scratch document (pre-filled from the mirror when possible) and persist to
//! the mirror only. Once the store is ready, `get` returns the host's bucket,
//! restored from the mirror when it came back empty, with any bootstrap edits
//! merged in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::document::{lock, looks_empty, migrate, new_shared, replace_contents, saved_at, stamp, Document, SharedDocument};
use crate::error::{Result, SettingsError};
use crate::events::{Observers, StateEvent};
use crate::host::{HostBridge, NoticeLevel};
use crate::mirror::{should_apply_mirror, MirrorManager};
use crate::retry;
use crate::sanitize;
use crate::storage::MirrorSnapshot;
use crate::util::spawn_detached;

/// Runs right before every persist with the live document, e.g. to archive
/// the active conversation's state or to schedule an auto backup.
pub trait PersistHook: Send + Sync {
    fn before_persist(&self, live: &SharedDocument);
}

/// Per-session state of the bootstrap protocol.
struct SessionContext {
    scratch: SharedDocument,
    touched: AtomicBool,
    ready: AtomicBool,
    migrated: AtomicBool,
    deadline: u64,
    bootstrap_retry_scheduled: AtomicBool,
    flush_retry_scheduled: AtomicBool,
}

pub struct SettingsAccessor {
    config: EngineConfig,
    host: Arc<dyn HostBridge>,
    mirror: Arc<MirrorManager>,
    clock: Arc<dyn Clock>,
    observers: Arc<Observers>,
    session: SessionContext,
    hooks: Mutex<Vec<Arc<dyn PersistHook>>>,
}

impl SettingsAccessor {
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn HostBridge>,
        mirror: Arc<MirrorManager>,
        clock: Arc<dyn Clock>,
        observers: Arc<Observers>,
    ) -> Arc<Self> {
        let deadline = clock.now_millis() + config.init_grace_ms;
        let accessor = Arc::new(Self {
            config,
            host,
            mirror,
            clock,
            observers,
            session: SessionContext {
                scratch: new_shared(Document::new()),
                touched: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                migrated: AtomicBool::new(false),
                deadline,
                bootstrap_retry_scheduled: AtomicBool::new(false),
                flush_retry_scheduled: AtomicBool::new(false),
            },
            hooks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&accessor);
        accessor.mirror.set_apply_hook(move |snapshot| {
            if let Some(accessor) = weak.upgrade() {
                accessor.apply_durable_snapshot(snapshot);
            }
        });
        accessor
    }

    pub fn mirror(&self) -> &Arc<MirrorManager> {
        &self.mirror
    }

    pub fn add_persist_hook(&self, hook: Arc<dyn PersistHook>) {
        self.hooks().push(hook);
    }

    pub fn clear_persist_hooks(&self) {
        self.hooks().clear();
    }

    fn hooks(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn PersistHook>>> {
        self.hooks.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_bootstrapping(&self) -> bool {
        !self.is_ready()
    }

    /// Whether the host store may be used. Latches: once ready, always ready.
    fn is_ready(&self) -> bool {
        if self.session.ready.load(Ordering::SeqCst) {
            return true;
        }
        if !self.host.settings_store_available() {
            return false;
        }
        let ready = self.host.settings_bucket().is_some()
            || self.mirror.has_non_empty_mirror()
            || self.clock.now_millis() >= self.session.deadline;
        if ready && !self.session.ready.swap(true, Ordering::SeqCst) {
            tracing::info!("host settings store is ready");
        }
        ready
    }

    /// The live settings document.
    ///
    /// During bootstrap this is the scratch document; callers that keep the
    /// handle across the transition must call `get` again to see the bucket.
    pub fn get(&self) -> SharedDocument {
        if !self.is_ready() {
            self.session.touched.store(true, Ordering::SeqCst);
            self.hydrate_scratch_from_mirror();
            return self.session.scratch.clone();
        }

        let bucket = self.host.ensure_settings_bucket();
        self.restore_from_mirror_if_empty();

        if self.session.touched.swap(false, Ordering::SeqCst) {
            let scratch = std::mem::take(&mut *lock(&self.session.scratch));
            let mut live = lock(&bucket);
            for (key, value) in scratch {
                live.entry(key).or_insert(value);
            }
        }

        if !self.session.migrated.swap(true, Ordering::SeqCst) && migrate(&mut lock(&bucket)) {
            tracing::info!("migrated settings document");
        }
        bucket
    }

    /// The current document without any restore or merge side effects.
    pub fn peek(&self) -> Document {
        let doc = match self.host.settings_bucket() {
            Some(bucket) if self.session.ready.load(Ordering::SeqCst) => bucket,
            _ => self.session.scratch.clone(),
        };
        let snapshot = lock(&doc).clone();
        snapshot
    }

    fn hydrate_scratch_from_mirror(&self) {
        if !looks_empty(&lock(&self.session.scratch)) {
            return;
        }
        if let Some(snapshot) = self.mirror.read_payload() {
            let mut scratch = lock(&self.session.scratch);
            if looks_empty(&scratch) {
                replace_contents(&mut scratch, snapshot.data);
            }
        }
    }

    /// Replace the live document with the mirror when arbitration allows it.
    pub fn restore_from_mirror_if_empty(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        match self.mirror.read_payload() {
            Some(snapshot) => self.apply_snapshot(snapshot),
            None => false,
        }
    }

    fn apply_durable_snapshot(&self, snapshot: &MirrorSnapshot) {
        if self.is_ready() {
            self.apply_snapshot(snapshot.clone());
        } else {
            self.hydrate_scratch_from_mirror();
        }
    }

    fn apply_snapshot(&self, snapshot: MirrorSnapshot) -> bool {
        let MirrorSnapshot { at, mut data } = snapshot;
        if data.is_empty() {
            return false;
        }
        let bucket = self.host.ensure_settings_bucket();
        {
            let mut live = lock(&bucket);
            // An empty-looking mirror only seeds a bucket that has nothing at all.
            if looks_empty(&data) && !live.is_empty() {
                return false;
            }
            if !should_apply_mirror(&live, at, self.config.staleness_slop_ms) {
                return false;
            }
            if at > 0 && saved_at(&data) == 0 {
                stamp(&mut data, at);
            }
            replace_contents(&mut live, data);
        }
        tracing::info!(at, "restored settings from mirror");
        self.observers.emit(StateEvent::MirrorRestored);
        true
    }

    /// Swap the whole document, stamped as the newest state so the mirror
    /// does not win it back.
    pub fn replace_document(&self, data: Document) {
        let live = self.get();
        let mut doc = lock(&live);
        replace_contents(&mut doc, data);
        stamp(&mut doc, self.mirror.next_stamp());
    }

    /// Re-stamp after an in-place edit that copied old state back in.
    pub fn touch(&self) {
        let live = self.get();
        stamp(&mut lock(&live), self.mirror.next_stamp());
    }

    /// Save the document: to the mirror always, to the host once it is ready.
    pub fn persist(self: &Arc<Self>) {
        if !self.is_ready() {
            self.session.touched.store(true, Ordering::SeqCst);
            let snapshot = {
                let mut scratch = lock(&self.session.scratch);
                stamp(&mut scratch, self.mirror.next_stamp());
                scratch.clone()
            };
            self.mirror.write_mirror(&snapshot);
            self.schedule_bootstrap_retry();
            return;
        }

        let live = self.get();
        let hooks: Vec<Arc<dyn PersistHook>> = self.hooks().clone();
        for hook in hooks {
            hook.before_persist(&live);
        }

        let snapshot = {
            let mut doc = lock(&live);
            if looks_empty(&doc) && self.mirror.has_recoverable_data() {
                None
            } else {
                stamp(&mut doc, self.mirror.next_stamp());
                Some(doc.clone())
            }
        };
        let Some(snapshot) = snapshot else {
            tracing::warn!("refusing to save an empty document over mirrored data");
            self.restore_from_mirror_if_empty();
            return;
        };

        self.mirror.write_mirror(&snapshot);
        self.flush_host();
    }

    fn schedule_bootstrap_retry(self: &Arc<Self>) {
        if self.session.bootstrap_retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let spawned = spawn_detached(async move {
            let policy = this.config.retry.clone();
            let ready = retry::wait_until(&policy, "persist during bootstrap", || this.is_ready()).await;
            this.session.bootstrap_retry_scheduled.store(false, Ordering::SeqCst);
            if ready {
                this.persist();
            } else {
                tracing::warn!("host settings store never became ready");
                this.host.notify(
                    NoticeLevel::Warning,
                    "UIE could not reach the settings store. Changes are kept in the local mirror.",
                );
            }
        });
        if spawned.is_none() {
            self.session.bootstrap_retry_scheduled.store(false, Ordering::SeqCst);
        }
    }

    fn flush_host(self: &Arc<Self>) {
        match self.host.request_flush() {
            Ok(()) => {}
            Err(SettingsError::HostNotReady) => self.schedule_flush_retry(),
            Err(e) => tracing::error!("host settings flush failed: {e}"),
        }
    }

    fn schedule_flush_retry(self: &Arc<Self>) {
        if self.session.flush_retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let spawned = spawn_detached(async move {
            let policy = this.config.flush_retry();
            let flushed = retry::wait_until(&policy, "host flush", || this.host.request_flush().is_ok()).await;
            this.session.flush_retry_scheduled.store(false, Ordering::SeqCst);
            if !flushed {
                tracing::warn!("host flush still failing, mirror holds the latest state");
            }
        });
        if spawned.is_none() {
            self.session.flush_retry_scheduled.store(false, Ordering::SeqCst);
        }
    }

    /// Fill in defaults and save.
    ///
    /// Fails with [`SettingsError::NotHydrated`] while the live document is
    /// still empty within the grace window and a mirror may yet restore it;
    /// callers retry later.
    pub fn sanitize_settings(self: &Arc<Self>) -> Result<()> {
        let persistent = self.is_ready();
        let live = self.get();

        let still_empty = looks_empty(&lock(&live));
        if persistent && still_empty && self.clock.now_millis() < self.session.deadline {
            self.mirror.kick_durable_load();
            if self.mirror.has_recoverable_data() || self.mirror.durable_load_pending() {
                return Err(SettingsError::NotHydrated);
            }
        }

        let worth_saving = {
            let mut doc = lock(&live);
            sanitize::apply_defaults(&mut doc);
            !looks_empty(&doc)
        };
        if persistent && worth_saving {
            self.persist();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::MemoryHost;
    use crate::storage::{MemoryDurableStore, MemoryStorage};
    use serde_json::json;

    const T: u64 = 1_700_000_000_000;

    struct Fixture {
        host: Arc<MemoryHost>,
        clock: Arc<ManualClock>,
        durable: Arc<MemoryDurableStore>,
        accessor: Arc<SettingsAccessor>,
    }

    fn fixture(host: MemoryHost) -> Fixture {
        let host = Arc::new(host);
        let clock = Arc::new(ManualClock::new(T));
        let storage = Arc::new(MemoryStorage::new(1 << 20));
        let durable = Arc::new(MemoryDurableStore::new());
        let mirror = Arc::new(MirrorManager::new(
            storage,
            durable.clone(),
            host.clone(),
            clock.clone(),
        ));
        let accessor = SettingsAccessor::new(
            EngineConfig::default(),
            host.clone(),
            mirror,
            clock.clone(),
            Arc::new(Observers::new()),
        );
        Fixture { host, clock, durable, accessor }
    }

    fn torch() -> serde_json::Value {
        json!({"items": [{"name": "Torch"}]})
    }

    #[tokio::test]
    async fn test_bootstrap_edit_survives_hydration() {
        let f = fixture(MemoryHost::new());
        assert!(f.accessor.is_bootstrapping());

        let scratch = f.accessor.get();
        lock(&scratch).insert("inventory".into(), torch());
        f.accessor.persist();
        assert_eq!(f.host.flush_count(), 0);

        f.host.hydrate(None);
        let live = f.accessor.get();
        assert!(!f.accessor.is_bootstrapping());
        assert_eq!(lock(&live)["inventory"], torch());
        assert_eq!(f.host.bucket_snapshot().unwrap()["inventory"], torch());
    }

    #[tokio::test]
    async fn test_scratch_merge_keeps_bucket_values() {
        let f = fixture(MemoryHost::new());
        lock(&f.accessor.get()).insert("enabled".into(), json!(false));
        f.host.hydrate(Some(json!({"enabled": true, "diary": {"a": 1}}).as_object().cloned().unwrap()));
        let live = f.accessor.get();
        assert_eq!(lock(&live)["enabled"], json!(true));
    }

    #[tokio::test]
    async fn test_ready_after_grace_without_bucket() {
        let f = fixture(MemoryHost::new());
        f.accessor.mirror().wait_durable_load().await;
        f.host.hydrate(None);
        // Store up, no bucket, no mirror: wait out the grace period.
        assert!(f.accessor.is_bootstrapping());
        f.clock.advance(30_000);
        assert!(!f.accessor.is_bootstrapping());
        f.clock.set(T);
        assert!(!f.accessor.is_bootstrapping());
    }

    #[tokio::test]
    async fn test_empty_bucket_restored_from_mirror() {
        let f = fixture(MemoryHost::hydrated(Some(Document::new())));
        lock(&f.accessor.get()).insert("inventory".into(), torch());
        f.accessor.persist();

        f.host.clear_bucket();
        let live = f.accessor.get();
        assert_eq!(lock(&live)["inventory"], torch());
    }

    #[tokio::test]
    async fn test_persist_refuses_empty_over_mirror() {
        let f = fixture(MemoryHost::hydrated(Some(Document::new())));
        lock(&f.accessor.get()).insert("inventory".into(), torch());
        f.accessor.persist();

        // Wipe the bucket directly, bypassing restore, then save.
        let live = f.host.settings_bucket().unwrap();
        lock(&live).clear();
        lock(&live).insert("ui".into(), json!({}));
        lock(&live).insert(crate::document::SAVED_AT_KEY.into(), json!(T + 60_000));
        f.accessor.persist();

        assert_eq!(lock(&live)["inventory"], torch());
    }

    #[tokio::test]
    async fn test_sanitize_refuses_while_mirror_may_restore() {
        let f = fixture(MemoryHost::hydrated(Some(Document::new())));
        let record = json!({"id": "current", "at": T, "data": {"inventory": torch()}});
        use crate::storage::DurableStore;
        f.durable.put("mirror", "current", record).await.unwrap();

        // Durable load in flight: the document may still come back.
        assert!(matches!(
            f.accessor.sanitize_settings(),
            Err(SettingsError::NotHydrated)
        ));
        f.accessor.mirror().wait_durable_load().await;

        assert!(f.accessor.sanitize_settings().is_ok());
        let live = f.accessor.get();
        assert_eq!(lock(&live)["inventory"]["items"], torch()["items"]);
        assert_eq!(lock(&live)["currencySymbol"], json!("G"));
    }

    #[tokio::test]
    async fn test_sanitize_applies_defaults_on_fresh_install() {
        let f = fixture(MemoryHost::hydrated(Some(Document::new())));
        f.accessor.sanitize_settings().unwrap();
        let doc = f.host.bucket_snapshot().unwrap();
        assert_eq!(doc["currencyRate"], json!(1));
        assert!(f.host.flush_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_retried_once_host_context_is_up() {
        let f = fixture(MemoryHost::hydrated(Some(Document::new())));
        f.host.set_context_ready(false);
        lock(&f.accessor.get()).insert("diary".into(), json!({"d": 1}));
        f.accessor.persist();
        assert_eq!(f.host.flush_count(), 0);

        f.host.set_context_ready(true);
        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        assert_eq!(f.host.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_replace_document_beats_mirror() {
        let f = fixture(MemoryHost::hydrated(Some(Document::new())));
        lock(&f.accessor.get()).insert("inventory".into(), torch());
        f.accessor.persist();

        let old = json!({"diary": {"entry": "old"}, "__uie_saved_at": 5})
            .as_object()
            .cloned()
            .unwrap();
        f.accessor.replace_document(old);
        f.accessor.persist();
        let live = f.accessor.get();
        assert_eq!(lock(&live)["diary"]["entry"], json!("old"));
        assert!(lock(&live).get("inventory").is_none());
    }
}
