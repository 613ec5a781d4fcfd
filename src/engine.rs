//! Wires the persistence components together and runs the background loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::accessor::SettingsAccessor;
use crate::backup::{AutoBackupHook, BackupManager};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::{Result, SettingsError};
use crate::events::{Observers, StateEvent, SubscriptionId};
use crate::host::{HostBridge, NoticeLevel};
use crate::layout::{self, LAUNCHER_ID};
use crate::mirror::MirrorManager;
use crate::partition::{self, ChatPartitioner};
use crate::retry;
use crate::saved_states::SavedStates;
use crate::storage::{DurableStore, LocalStorage};
use crate::watchdog::FailsafeWatchdog;

/// Whether user-facing notices are enabled (`ui.showPopups`, default on).
pub fn popups_enabled(doc: &Document) -> bool {
    doc.get("ui")
        .and_then(|ui| ui.get("showPopups"))
        .and_then(Value::as_bool)
        != Some(false)
}

fn refresh_layout(accessor: &SettingsAccessor, host: &dyn HostBridge) {
    let Some(viewport) = host.viewport() else {
        return;
    };
    let plan = layout::compute_layout(&accessor.peek(), &viewport, host.element_rect(LAUNCHER_ID));
    host.apply_layout(&plan);
}

pub struct Engine {
    config: EngineConfig,
    host: Arc<dyn HostBridge>,
    observers: Arc<Observers>,
    mirror: Arc<MirrorManager>,
    accessor: Arc<SettingsAccessor>,
    partitioner: Arc<ChatPartitioner>,
    watchdog: Arc<FailsafeWatchdog>,
    backups: Arc<BackupManager>,
    saved_states: SavedStates,
    layout_subscription: SubscriptionId,
    poller_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    watchdog_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    active: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn HostBridge>,
        storage: Arc<dyn LocalStorage>,
        durable: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let observers = Arc::new(Observers::new());
        let mirror = Arc::new(MirrorManager::new(
            storage.clone(),
            durable.clone(),
            host.clone(),
            clock.clone(),
        ));
        let accessor = SettingsAccessor::new(
            config.clone(),
            host.clone(),
            mirror.clone(),
            clock.clone(),
            observers.clone(),
        );
        let partitioner = ChatPartitioner::new(accessor.clone(), host.clone(), observers.clone());
        let watchdog = Arc::new(FailsafeWatchdog::new(
            accessor.clone(),
            host.clone(),
            observers.clone(),
            clock.clone(),
            config.recover_min_interval_ms,
        ));
        let backups = BackupManager::new(
            &config,
            accessor.clone(),
            durable,
            storage,
            host.clone(),
            observers.clone(),
            clock.clone(),
        );
        let saved_states = SavedStates::new(accessor.clone(), observers.clone(), clock);

        accessor.add_persist_hook(partitioner.clone());
        accessor.add_persist_hook(Arc::new(AutoBackupHook(backups.clone())));

        let layout_subscription = {
            let accessor = accessor.clone();
            let host = host.clone();
            observers.on_document_replaced(move |_| refresh_layout(&accessor, host.as_ref()))
        };

        Self {
            config,
            host,
            observers,
            mirror,
            accessor,
            partitioner,
            watchdog,
            backups,
            saved_states,
            layout_subscription,
            poller_handle: Arc::new(Mutex::new(None)),
            watchdog_handle: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn HostBridge> {
        &self.host
    }

    pub fn observers(&self) -> &Arc<Observers> {
        &self.observers
    }

    pub fn mirror(&self) -> &Arc<MirrorManager> {
        &self.mirror
    }

    pub fn accessor(&self) -> &Arc<SettingsAccessor> {
        &self.accessor
    }

    pub fn partitioner(&self) -> &Arc<ChatPartitioner> {
        &self.partitioner
    }

    pub fn watchdog(&self) -> &Arc<FailsafeWatchdog> {
        &self.watchdog
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn saved_states(&self) -> &SavedStates {
        &self.saved_states
    }

    /// Startup sequence: durable mirror, first conversation check, defaults,
    /// backups, layout.
    pub async fn init(&self) -> Result<()> {
        self.mirror.wait_durable_load().await;

        if !partition::ensure_chat_state_loaded(self.host.as_ref()).await {
            tracing::warn!("host context did not come up, continuing with bootstrap document");
        }
        self.partitioner.check_and_load();

        let accessor = self.accessor.clone();
        match retry::retry_async(&self.config.retry, "sanitize settings", || {
            let result = accessor.sanitize_settings();
            async move { result }
        })
        .await
        {
            Ok(()) => {}
            Err(SettingsError::NotHydrated) => {
                tracing::warn!("settings never hydrated, defaults not applied")
            }
            Err(e) => return Err(e),
        }

        self.backups.init_backups().await;
        self.update_layout();
        tracing::info!("settings engine initialized");
        Ok(())
    }

    /// Start the conversation poller and the watchdog.
    pub async fn start_background(&self) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            return Err(SettingsError::Custom(
                "Background tasks are already running".into(),
            ));
        }
        self.active.store(true, Ordering::SeqCst);

        let poll_interval = self.config.chat_poll_interval();
        let poller_active = self.active.clone();
        let partitioner = self.partitioner.clone();
        let poller_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if !poller_active.load(Ordering::SeqCst) {
                    break;
                }
                partitioner.check_and_load();
            }
        });

        let first_check = Duration::from_millis(self.config.watchdog_first_check_ms);
        let interval = self.config.watchdog_interval();
        let watchdog_active = self.active.clone();
        let watchdog = self.watchdog.clone();
        let watchdog_handle = tokio::spawn(async move {
            tokio::time::sleep(first_check).await;
            loop {
                if !watchdog_active.load(Ordering::SeqCst) {
                    break;
                }
                watchdog.tick();
                tokio::time::sleep(interval).await;
            }
        });

        *self.poller_handle.lock().await = Some(poller_handle);
        *self.watchdog_handle.lock().await = Some(watchdog_handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the loops without waiting (usable from `Drop` and sync contexts).
    pub fn kill_background(&self) {
        self.active.store(false, Ordering::SeqCst);
        for slot in [&self.poller_handle, &self.watchdog_handle] {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }

    /// Stop everything and wait for in-flight durable writes.
    pub async fn teardown(&self) {
        self.active.store(false, Ordering::SeqCst);
        for slot in [&self.poller_handle, &self.watchdog_handle] {
            if let Some(handle) = slot.lock().await.take() {
                handle.abort();
            }
        }
        self.mirror.flush_pending().await;
        self.accessor.clear_persist_hooks();
        self.observers.unsubscribe(self.layout_subscription);
        tracing::info!("settings engine stopped");
    }

    pub fn update_layout(&self) {
        refresh_layout(&self.accessor, self.host.as_ref());
    }

    /// Persist after a batch of edits, optionally re-running layout and
    /// telling observers.
    pub fn commit_state_update(&self, layout: bool, emit: bool) {
        self.accessor.persist();
        if layout {
            self.update_layout();
        }
        if emit {
            self.observers.emit(StateEvent::Committed);
        }
    }

    /// Show a notice unless the user turned popups off.
    pub fn notify(&self, level: NoticeLevel, message: &str) {
        if popups_enabled(&self.accessor.peek()) {
            self.host.notify(level, message);
        } else {
            tracing::debug!(?level, message, "notice suppressed");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.kill_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupReason;
    use crate::clock::ManualClock;
    use crate::document::lock;
    use crate::host::MemoryHost;
    use crate::layout::Viewport;
    use crate::storage::{MemoryDurableStore, MemoryStorage};
    use serde_json::json;

    fn engine(host: Arc<MemoryHost>) -> Engine {
        Engine::new(
            EngineConfig::default(),
            host,
            Arc::new(MemoryStorage::new(1 << 20)),
            Arc::new(MemoryDurableStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    #[test]
    fn test_popups_flag() {
        let off = json!({"ui": {"showPopups": false}}).as_object().cloned().unwrap();
        assert!(!popups_enabled(&off));
        assert!(popups_enabled(&Document::new()));
    }

    #[tokio::test]
    async fn test_init_applies_defaults_and_backs_up() {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        host.set_conversation(Some("chat1"));
        let engine = engine(host.clone());
        engine.init().await.unwrap();

        let doc = host.bucket_snapshot().unwrap();
        assert_eq!(doc["currencySymbol"], json!("G"));
        assert_eq!(engine.partitioner().last_conversation_id().as_deref(), Some("chat1"));
        let backups = engine.backups().list_backups().await.unwrap();
        assert!(backups.iter().any(|b| b.reason == BackupReason::Init));
        engine.teardown().await;
    }

    #[tokio::test]
    async fn test_notices_respect_show_popups() {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        let engine = engine(host.clone());
        engine.notify(NoticeLevel::Info, "shown");
        lock(&engine.accessor().get()).insert("ui".into(), json!({"showPopups": false}));
        engine.notify(NoticeLevel::Info, "hidden");
        let messages: Vec<String> = host.notices().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages, vec!["shown".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_runs_layout_and_emits() {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        host.set_viewport(Some(Viewport { width: 1280.0, height: 720.0, touch: false }));
        let engine = engine(host.clone());
        let mut rx = engine.observers().subscribe();

        lock(&engine.accessor().get()).insert("ui".into(), json!({"scale": 1.2}));
        engine.commit_state_update(true, true);

        assert_eq!(host.layouts().last().unwrap().scale, 1.2);
        assert_eq!(rx.recv().await.unwrap(), StateEvent::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_poller_follows_conversation() {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        host.set_conversation(Some("a"));
        let engine = engine(host.clone());
        engine.start_background().await.unwrap();
        assert!(engine.start_background().await.is_err());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(engine.partitioner().last_conversation_id().as_deref(), Some("a"));

        host.set_conversation(Some("b"));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(engine.partitioner().last_conversation_id().as_deref(), Some("b"));

        engine.teardown().await;
        assert!(!engine.is_running());
    }
}
