//! Rolling backups of the settings document in the durable store, plus JSON
//! export and import.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accessor::{PersistHook, SettingsAccessor};
use crate::clock::{Clock, MonotonicStamp};
use crate::config::EngineConfig;
use crate::document::{lock, looks_empty, safe_json, Document, SharedDocument};
use crate::error::{Result, SettingsError};
use crate::events::{Observers, StateEvent};
use crate::host::{HostBridge, NoticeLevel};
use crate::storage::{DurableStore, LocalStorage};
use crate::util::{iso_date, spawn_detached};

pub const BACKUP_COLLECTION: &str = "backups";
/// Set once a backup of a non-empty document was taken on this profile.
pub const HAD_DATA_KEY: &str = "uie_had_data_v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupReason {
    Manual,
    Auto,
    Import,
    Init,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: u64,
    pub at: u64,
    pub reason: BackupReason,
    pub data: Document,
}

/// An export ready to be written out.
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub filename: String,
    pub contents: String,
}

#[derive(Default)]
struct AutoState {
    last_at: Option<u64>,
    last_signature: String,
}

pub struct BackupManager {
    accessor: Arc<SettingsAccessor>,
    durable: Arc<dyn DurableStore>,
    storage: Arc<dyn LocalStorage>,
    host: Arc<dyn HostBridge>,
    observers: Arc<Observers>,
    clock: Arc<dyn Clock>,
    max_backups: usize,
    auto_interval_ms: u64,
    auto: Mutex<AutoState>,
    prompted: AtomicBool,
    ids: MonotonicStamp,
}

impl BackupManager {
    pub fn new(
        config: &EngineConfig,
        accessor: Arc<SettingsAccessor>,
        durable: Arc<dyn DurableStore>,
        storage: Arc<dyn LocalStorage>,
        host: Arc<dyn HostBridge>,
        observers: Arc<Observers>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            accessor,
            durable,
            storage,
            host,
            observers,
            clock,
            max_backups: config.max_backups,
            auto_interval_ms: config.auto_backup_interval_ms,
            auto: Mutex::new(AutoState::default()),
            prompted: AtomicBool::new(false),
            ids: MonotonicStamp::default(),
        })
    }

    fn auto_state(&self) -> std::sync::MutexGuard<'_, AutoState> {
        self.auto.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot_state(&self) -> Document {
        let live = self.accessor.get();
        let snapshot = lock(&live).clone();
        snapshot
    }

    fn mark_had_data(&self, state: &Document) {
        if !looks_empty(state) {
            let _ = self.storage.set_item(HAD_DATA_KEY, "1");
        }
    }

    fn had_data_before(&self) -> bool {
        self.storage.get_item(HAD_DATA_KEY).as_deref() == Some("1")
    }

    /// Store the current document as a new backup and trim the ring.
    pub async fn create_backup(&self, reason: BackupReason) -> Result<BackupRecord> {
        let data = self.snapshot_state();
        self.mark_had_data(&data);
        let now = self.clock.now_millis();
        let record = BackupRecord {
            id: self.ids.next(now),
            at: now,
            reason,
            data,
        };

        let value = serde_json::to_value(&record)?;
        if let Err(e) = self
            .durable
            .put(BACKUP_COLLECTION, &record.id.to_string(), value)
            .await
        {
            tracing::error!("backup failed: {e}");
            return Err(e);
        }
        tracing::info!(id = record.id, ?reason, "backup created");

        if let Err(e) = self.trim().await {
            tracing::warn!("failed to trim old backups: {e}");
        }
        Ok(record)
    }

    /// Keep the newest `max_backups` by id.
    async fn trim(&self) -> Result<()> {
        let mut ids: Vec<u64> = self
            .durable
            .keys(BACKUP_COLLECTION)
            .await?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect();
        if ids.len() <= self.max_backups {
            return Ok(());
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let stale: Vec<String> = ids[self.max_backups..]
            .iter()
            .map(|id| id.to_string())
            .collect();
        tracing::debug!(count = stale.len(), "removing old backups");
        self.durable.delete(BACKUP_COLLECTION, &stale).await
    }

    /// All readable backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .durable
            .get_all(BACKUP_COLLECTION)
            .await?
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<BackupRecord>(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!("skipping malformed backup record: {e}");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    pub async fn latest(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list_backups().await?.into_iter().next())
    }

    /// Overwrite the live document with the newest backup.
    pub async fn restore_latest_backup(&self) -> Result<BackupRecord> {
        let record = match self.latest().await? {
            Some(r) if !r.data.is_empty() => r,
            _ => return Err(SettingsError::NoBackup),
        };
        self.accessor.replace_document(record.data.clone());
        self.accessor.persist();
        tracing::info!(id = record.id, "restored from backup");
        self.observers
            .emit(StateEvent::BackupRestored { id: record.id });
        Ok(record)
    }

    /// Cheap synchronous check used before scheduling an auto backup.
    pub fn auto_backup_due(&self) -> bool {
        let now = self.clock.now_millis();
        match self.auto_state().last_at {
            Some(last) => now.saturating_sub(last) >= self.auto_interval_ms,
            None => true,
        }
    }

    /// Rate-limited backup that is skipped when the document has not visibly
    /// changed since the last one.
    pub async fn backup_maybe_auto(&self) -> Result<Option<BackupRecord>> {
        let now = self.clock.now_millis();
        let state = self.snapshot_state();
        {
            let mut auto = self.auto_state();
            if let Some(last) = auto.last_at {
                if now.saturating_sub(last) < self.auto_interval_ms {
                    return Ok(None);
                }
            }
            let signature = format!("{}:{}", state.len(), safe_json(&state).len());
            auto.last_at = Some(now);
            if signature == auto.last_signature {
                return Ok(None);
            }
            auto.last_signature = signature;
        }
        self.create_backup(BackupReason::Auto).await.map(Some)
    }

    /// Once per session: if the document came up empty but this profile had
    /// data before, restore the newest backup without asking.
    pub async fn maybe_offer_auto_restore(&self) -> bool {
        if self.prompted.load(Ordering::SeqCst) {
            return false;
        }
        if !looks_empty(&self.snapshot_state()) {
            return false;
        }
        let latest = match self.latest().await {
            Ok(Some(r)) => r,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("could not read backups: {e}");
                return false;
            }
        };
        if looks_empty(&latest.data) || !self.had_data_before() {
            return false;
        }
        self.prompted.store(true, Ordering::SeqCst);
        match self.restore_latest_backup().await {
            Ok(_) => {
                self.host
                    .notify(NoticeLevel::Success, "UIE restored from latest backup.");
                true
            }
            Err(e) => {
                tracing::warn!("automatic restore failed: {e}");
                false
            }
        }
    }

    /// Pretty JSON of the live document, named after today's date.
    pub fn export_json(&self) -> Result<ExportFile> {
        let state = self.snapshot_state();
        Ok(ExportFile {
            filename: format!("uie_backup_{}.json", iso_date(self.clock.now_millis())),
            contents: serde_json::to_string_pretty(&state)?,
        })
    }

    /// Replace the live document with an imported JSON object.
    pub async fn import_json(&self, text: &str) -> Result<()> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SettingsError::InvalidImport(e.to_string()))?;
        let Value::Object(data) = value else {
            return Err(SettingsError::InvalidImport(
                "top-level value must be an object".into(),
            ));
        };
        self.accessor.replace_document(data);
        self.accessor.persist();
        self.observers.emit(StateEvent::Imported);
        if let Err(e) = self.create_backup(BackupReason::Import).await {
            tracing::warn!("import applied but backup failed: {e}");
        }
        Ok(())
    }

    /// Startup: offer the automatic restore, then take an init backup.
    pub async fn init_backups(&self) {
        self.maybe_offer_auto_restore().await;
        if let Err(e) = self.create_backup(BackupReason::Init).await {
            tracing::warn!("init backup failed: {e}");
        }
    }
}

/// Schedules an auto backup after saves.
pub struct AutoBackupHook(pub Arc<BackupManager>);

impl PersistHook for AutoBackupHook {
    fn before_persist(&self, _live: &SharedDocument) {
        if !self.0.auto_backup_due() {
            return;
        }
        let manager = self.0.clone();
        spawn_detached(async move {
            if let Err(e) = manager.backup_maybe_auto().await {
                tracing::warn!("auto backup failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::MemoryHost;
    use crate::mirror::MirrorManager;
    use crate::storage::{MemoryDurableStore, MemoryStorage};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const T: u64 = 1_700_000_000_000;

    struct Fixture {
        host: Arc<MemoryHost>,
        clock: Arc<ManualClock>,
        storage: Arc<MemoryStorage>,
        durable: Arc<MemoryDurableStore>,
        accessor: Arc<SettingsAccessor>,
        backups: Arc<BackupManager>,
    }

    fn fixture(bucket: Document) -> Fixture {
        let config = EngineConfig::default();
        let host = Arc::new(MemoryHost::hydrated(Some(bucket)));
        let clock = Arc::new(ManualClock::new(T));
        let storage = Arc::new(MemoryStorage::new(1 << 20));
        let durable = Arc::new(MemoryDurableStore::new());
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
            mirror,
            clock.clone(),
            observers.clone(),
        );
        let backups = BackupManager::new(
            &config,
            accessor.clone(),
            durable.clone(),
            storage.clone(),
            host.clone(),
            observers,
            clock.clone(),
        );
        Fixture { host, clock, storage, durable, accessor, backups }
    }

    fn diary(entry: &str) -> Document {
        json!({"diary": {"d1": entry}}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_ring_keeps_newest_twenty() {
        let f = fixture(diary("a"));
        for _ in 0..23 {
            f.backups.create_backup(BackupReason::Manual).await.unwrap();
        }
        let list = f.backups.list_backups().await.unwrap();
        assert_eq!(list.len(), 20);
        assert!(list.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(list.last().unwrap().id, T + 3);
        assert_eq!(f.storage.get_item(HAD_DATA_KEY).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_restore_latest_overwrites_document() {
        let f = fixture(diary("before"));
        f.backups.create_backup(BackupReason::Manual).await.unwrap();
        lock(&f.accessor.get()).insert("diary".into(), json!({"d1": "after"}));
        f.accessor.persist();

        let record = f.backups.restore_latest_backup().await.unwrap();
        assert_eq!(record.reason, BackupReason::Manual);
        assert_eq!(lock(&f.accessor.get())["diary"]["d1"], json!("before"));
    }

    #[tokio::test]
    async fn test_restore_without_backup() {
        let f = fixture(Document::new());
        assert!(matches!(
            f.backups.restore_latest_backup().await,
            Err(SettingsError::NoBackup)
        ));
    }

    #[tokio::test]
    async fn test_auto_backup_rate_limit_and_signature() {
        let f = fixture(diary("a"));
        assert!(f.backups.backup_maybe_auto().await.unwrap().is_some());
        assert!(f.backups.backup_maybe_auto().await.unwrap().is_none());

        // Same shape after the interval: skipped, but the clock restarts.
        f.clock.advance(45_000);
        assert!(f.backups.backup_maybe_auto().await.unwrap().is_none());

        lock(&f.accessor.get()).insert("databank".into(), json!({"k": "v"}));
        f.clock.advance(45_000);
        assert!(f.backups.backup_maybe_auto().await.unwrap().is_some());
        assert_eq!(f.durable.put_count(), 2);
    }

    #[tokio::test]
    async fn test_auto_restore_needs_prior_data() {
        let f = fixture(diary("kept"));
        f.backups.create_backup(BackupReason::Manual).await.unwrap();

        lock(&f.host.settings_bucket().unwrap()).clear();
        // Also lose the mirror so only the backup remains.
        f.storage.remove_item(crate::mirror::MIRROR_KEY);

        assert!(f.backups.maybe_offer_auto_restore().await);
        assert_eq!(lock(&f.accessor.get())["diary"]["d1"], json!("kept"));
        assert!(f
            .host
            .notices()
            .iter()
            .any(|(level, _)| *level == NoticeLevel::Success));

        // Once per session.
        lock(&f.host.settings_bucket().unwrap()).clear();
        assert!(!f.backups.maybe_offer_auto_restore().await);
    }

    #[tokio::test]
    async fn test_export_and_import() {
        let f = fixture(diary("exported"));
        let export = f.backups.export_json().unwrap();
        assert_eq!(export.filename, "uie_backup_2023-11-14.json");
        assert!(export.contents.contains("\n  \"diary\""));

        lock(&f.accessor.get()).insert("diary".into(), json!({"d1": "changed"}));
        f.backups.import_json(&export.contents).await.unwrap();
        assert_eq!(lock(&f.accessor.get())["diary"]["d1"], json!("exported"));

        let latest = f.backups.latest().await.unwrap().unwrap();
        assert_eq!(latest.reason, BackupReason::Import);
    }

    #[tokio::test]
    async fn test_import_rejects_non_objects() {
        let f = fixture(diary("safe"));
        for bad in ["[1,2]", "42", "not json"] {
            assert!(matches!(
                f.backups.import_json(bad).await,
                Err(SettingsError::InvalidImport(_))
            ));
        }
        assert_eq!(lock(&f.accessor.get())["diary"]["d1"], json!("safe"));
    }
}
