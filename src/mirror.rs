//! Best durable copy of the settings document across the fast local cache
//! and the durable store.
//!
//! Writes go to the local cache; when that fails (quota, disabled) they fall
//! back to the durable store in the background. Reads prefer whichever
//! snapshot is newest. A background load of the durable copy is started early
//! so the first read never blocks on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::{Clock, MonotonicStamp};
use crate::document::{has_user_data, looks_empty, saved_at, stamp, Document};
use crate::host::{HostBridge, NoticeLevel};
use crate::storage::{DurableStore, FastLocalCache, LocalStorage, MirrorSnapshot};
use crate::util::spawn_detached;

pub const MIRROR_KEY: &str = "uie_settings_mirror_v1";
/// Set in local storage whenever the durable store holds a mirror.
pub const DURABLE_FLAG_KEY: &str = "uie_settings_mirror_idb_v1";
pub const MIRROR_COLLECTION: &str = "mirror";
pub const MIRROR_RECORD_ID: &str = "current";

#[derive(Debug, Serialize, Deserialize)]
struct MirrorRecord {
    id: String,
    #[serde(default)]
    at: u64,
    #[serde(default)]
    data: Document,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DurableLoad {
    NotStarted,
    Loading,
    Finished,
}

/// Where a mirror write ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorWrite {
    Local,
    DurableFallback,
    Skipped,
}

type ApplyHook = Arc<dyn Fn(&MirrorSnapshot) + Send + Sync>;

/// Arbitration between the live document and a mirror candidate.
///
/// A document that looks empty always yields. One with user data only yields
/// to a candidate that is strictly newer by more than `slop_ms`, which absorbs
/// same-tick races between the host's own save and a mirror read. Anything
/// else yields to any newer candidate.
pub fn should_apply_mirror(current: &Document, candidate_at: u64, slop_ms: u64) -> bool {
    if looks_empty(current) {
        return true;
    }
    let current_at = saved_at(current);
    if has_user_data(current) {
        candidate_at > 0 && (current_at == 0 || candidate_at > current_at + slop_ms)
    } else {
        candidate_at > current_at
    }
}

pub struct MirrorManager {
    local: FastLocalCache,
    storage: Arc<dyn LocalStorage>,
    durable: Arc<dyn DurableStore>,
    host: Arc<dyn HostBridge>,
    clock: Arc<dyn Clock>,
    durable_cache: Arc<Mutex<Option<MirrorSnapshot>>>,
    load_state: Arc<Mutex<DurableLoad>>,
    load_done: Arc<Notify>,
    apply_hook: Arc<Mutex<Option<ApplyHook>>>,
    fallback_notice_shown: AtomicBool,
    pending: Mutex<Vec<JoinHandle<()>>>,
    stamps: MonotonicStamp,
}

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl MirrorManager {
    pub fn new(
        storage: Arc<dyn LocalStorage>,
        durable: Arc<dyn DurableStore>,
        host: Arc<dyn HostBridge>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local: FastLocalCache::new(storage.clone(), MIRROR_KEY),
            storage,
            durable,
            host,
            clock,
            durable_cache: Arc::new(Mutex::new(None)),
            load_state: Arc::new(Mutex::new(DurableLoad::NotStarted)),
            load_done: Arc::new(Notify::new()),
            apply_hook: Arc::new(Mutex::new(None)),
            fallback_notice_shown: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            stamps: MonotonicStamp::default(),
        }
    }

    /// Called with the durable snapshot once the background load finds one.
    pub fn set_apply_hook<F>(&self, hook: F)
    where
        F: Fn(&MirrorSnapshot) + Send + Sync + 'static,
    {
        *guard(&self.apply_hook) = Some(Arc::new(hook));
    }

    /// Strictly increasing write timestamp.
    pub fn next_stamp(&self) -> u64 {
        self.stamps.next(self.clock.now_millis())
    }

    /// Mirror `doc`. Never fails: local errors fall back to the durable store,
    /// durable errors are reported to the user.
    pub fn write_mirror(&self, doc: &Document) -> MirrorWrite {
        if doc.is_empty() {
            return MirrorWrite::Skipped;
        }
        if looks_empty(doc) && self.has_recoverable_data() {
            tracing::warn!("not mirroring an empty-looking document over saved data");
            return MirrorWrite::Skipped;
        }

        let mut data = doc.clone();
        let at = match saved_at(&data) {
            0 => {
                let at = self.next_stamp();
                stamp(&mut data, at);
                at
            }
            at => at,
        };
        let snapshot = MirrorSnapshot { at, data };

        match self.local.write(&snapshot) {
            Ok(()) => MirrorWrite::Local,
            Err(e) => {
                tracing::warn!("local mirror write failed, using durable store: {e}");
                if !self.fallback_notice_shown.swap(true, Ordering::SeqCst) {
                    self.host.notify(
                        NoticeLevel::Info,
                        "UIE is using backup storage (local storage full or unavailable). Your data is still saved.",
                    );
                }
                self.write_durable(snapshot);
                MirrorWrite::DurableFallback
            }
        }
    }

    fn write_durable(&self, snapshot: MirrorSnapshot) {
        *guard(&self.durable_cache) = Some(snapshot.clone());

        let durable = self.durable.clone();
        let storage = self.storage.clone();
        let host = self.host.clone();
        let handle = spawn_detached(async move {
            let record = MirrorRecord {
                id: MIRROR_RECORD_ID.to_string(),
                at: snapshot.at,
                data: snapshot.data,
            };
            let value = match serde_json::to_value(&record) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("failed to encode durable mirror: {e}");
                    return;
                }
            };
            match durable.put(MIRROR_COLLECTION, MIRROR_RECORD_ID, value).await {
                Ok(()) => {
                    let _ = storage.set_item(DURABLE_FLAG_KEY, &record.at.to_string());
                }
                Err(e) => {
                    tracing::error!("durable mirror write failed: {e}");
                    host.notify(
                        NoticeLevel::Error,
                        "UIE could not persist settings (storage failed).",
                    );
                }
            }
        });

        if let Some(handle) = handle {
            let mut pending = guard(&self.pending);
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    /// Newest non-empty snapshot we know of, local or durable.
    pub fn read_payload(&self) -> Option<MirrorSnapshot> {
        let local = self.local.read().filter(|s| !s.data.is_empty());
        let durable = guard(&self.durable_cache)
            .clone()
            .filter(|s| !s.data.is_empty());
        if local.is_none() && durable.is_none() {
            self.kick_durable_load();
        }

        let normalize = |mut s: MirrorSnapshot| {
            if s.at == 0 {
                s.at = saved_at(&s.data);
            }
            s
        };
        match (local.map(normalize), durable.map(normalize)) {
            (Some(l), Some(d)) => Some(if d.at > l.at { d } else { l }),
            (l, d) => l.or(d),
        }
    }

    /// Cheap probe used to decide whether waiting for hydration is worthwhile.
    /// Also true while the durable copy is still loading or is known to exist.
    pub fn has_non_empty_mirror(&self) -> bool {
        if self.local.has_non_empty() {
            return true;
        }
        if guard(&self.durable_cache)
            .as_ref()
            .is_some_and(|s| !s.data.is_empty())
        {
            return true;
        }
        self.kick_durable_load();
        if self.durable_load_pending() {
            return true;
        }
        self.storage.get_item(DURABLE_FLAG_KEY).is_some()
    }

    /// A mirror exists and holds more than an empty shell.
    pub fn has_recoverable_data(&self) -> bool {
        self.read_payload().is_some_and(|s| !looks_empty(&s.data))
    }

    pub fn durable_load_pending(&self) -> bool {
        *guard(&self.load_state) == DurableLoad::Loading
    }

    /// Start loading the durable copy in the background, at most once.
    pub fn kick_durable_load(&self) {
        {
            let mut state = guard(&self.load_state);
            if *state != DurableLoad::NotStarted {
                return;
            }
            *state = DurableLoad::Loading;
        }

        let durable = self.durable.clone();
        let storage = self.storage.clone();
        let cache = self.durable_cache.clone();
        let load_state = self.load_state.clone();
        let load_done = self.load_done.clone();
        let apply_hook = self.apply_hook.clone();

        let spawned = spawn_detached(async move {
            let loaded = match durable.get(MIRROR_COLLECTION, MIRROR_RECORD_ID).await {
                Ok(Some(value)) => match serde_json::from_value::<MirrorRecord>(value) {
                    Ok(record) if !record.data.is_empty() => Some(record),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!("ignoring malformed durable mirror: {e}");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("durable mirror unavailable: {e}");
                    None
                }
            };

            match loaded {
                Some(record) => {
                    let mut data = record.data;
                    let at = match (record.at, saved_at(&data)) {
                        (0, 0) => 0,
                        (0, saved) => saved,
                        (at, 0) => {
                            stamp(&mut data, at);
                            at
                        }
                        (at, _) => at,
                    };
                    let snapshot = MirrorSnapshot { at, data };
                    tracing::info!(at, "loaded durable settings mirror");
                    {
                        let mut cached = guard(&cache);
                        // A fallback write during the load is newer than what we read.
                        if cached.as_ref().map_or(true, |c| c.at < snapshot.at) {
                            *cached = Some(snapshot.clone());
                        }
                    }
                    let _ = storage.set_item(DURABLE_FLAG_KEY, &at.max(1).to_string());
                    let hook = guard(&apply_hook).clone();
                    if let Some(hook) = hook {
                        hook(&snapshot);
                    }
                }
                None => {
                    if guard(&cache).is_none() {
                        storage.remove_item(DURABLE_FLAG_KEY);
                    }
                }
            }
            *guard(&load_state) = DurableLoad::Finished;
            load_done.notify_waiters();
        });

        if spawned.is_none() {
            *guard(&self.load_state) = DurableLoad::NotStarted;
        }
    }

    /// Wait for the background durable load to finish.
    pub async fn wait_durable_load(&self) {
        self.kick_durable_load();
        loop {
            let notified = self.load_done.notified();
            if !self.durable_load_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for in-flight durable writes.
    pub async fn flush_pending(&self) {
        let handles: Vec<JoinHandle<()>> = guard(&self.pending).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("durable mirror write task failed: {e}");
            }
        }
    }
}
