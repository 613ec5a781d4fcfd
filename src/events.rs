use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

/// Emitted whenever the live document was replaced or swapped underneath
/// the feature modules, so they re-render from the current state.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum StateEvent {
    MirrorRestored,
    #[serde(rename_all = "camelCase")]
    ChatLoaded { conversation_id: Option<String> },
    ChatReset,
    FailsafeRecovered { reason: String },
    BackupRestored { id: u64 },
    Imported,
    StateLoaded { name: String },
    SavedStatesChanged,
    Committed,
}

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&StateEvent) + Send + Sync>;

/// Fire-and-forget fan-out of [`StateEvent`]s: registered callbacks plus a
/// broadcast channel for async listeners.
pub struct Observers {
    callbacks: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<StateEvent>,
}

impl Default for Observers {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_document_replaced<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.callbacks().retain(|(k, _)| *k != id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Deliver to everyone. Callers must not hold a document lock.
    pub fn emit(&self, event: StateEvent) {
        tracing::debug!(?event, "state event");
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = self.callbacks().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in callbacks {
            cb(&event);
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.callbacks.lock().unwrap_or_else(|p| p.into_inner())
    }
}
