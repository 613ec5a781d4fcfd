//! Per-conversation partitioning of the session keys.
//!
//! The active conversation's state lives at the top level of the document;
//! every other conversation's state is archived under `chats[<id>]`. On a
//! switch the outgoing state is archived and the incoming one restored (or
//! cleared when it was never seen).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::accessor::{PersistHook, SettingsAccessor};
use crate::document::{is_non_empty_object, lock, Document, SharedDocument, SESSION_KEYS};
use crate::error::SettingsError;
use crate::events::{Observers, StateEvent};
use crate::host::HostBridge;
use crate::retry::{self, RetryPolicy};

const CHATS_KEY: &str = "chats";

/// Copy the session keys present in `doc` into `chats[id]`.
/// Does nothing when none of them is present.
pub fn archive_session(doc: &mut Document, id: &str) {
    let mut saved = Map::new();
    for key in SESSION_KEYS {
        if let Some(value) = doc.get(key) {
            saved.insert(key.to_string(), value.clone());
        }
    }
    if saved.is_empty() {
        return;
    }
    let chats = doc
        .entry(CHATS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !chats.is_object() {
        *chats = Value::Object(Map::new());
    }
    if let Value::Object(chats) = chats {
        chats.insert(id.to_string(), Value::Object(saved));
    }
}

/// Whether any conversation was ever archived. Documents written before
/// partitioning existed have none.
fn has_archives(doc: &Document) -> bool {
    doc.get(CHATS_KEY).is_some_and(is_non_empty_object)
}

fn archived_session(doc: &Document, id: &str) -> Option<Map<String, Value>> {
    doc.get(CHATS_KEY)?.get(id)?.as_object().cloned()
}

/// Install `saved` as the active session: keys it has are copied in, the rest
/// removed.
fn restore_session(doc: &mut Document, saved: &Map<String, Value>) {
    for key in SESSION_KEYS {
        match saved.get(key) {
            Some(value) => {
                doc.insert(key.to_string(), value.clone());
            }
            None => {
                doc.remove(key);
            }
        }
    }
}

fn clear_session(doc: &mut Document) {
    for key in SESSION_KEYS {
        doc.remove(key);
    }
}

/// Fresh values for the active conversation, as used by "reset chat data".
pub fn reset_session(doc: &mut Document) {
    doc.insert(
        "inventory".into(),
        json!({"items": [], "equipped": [], "skills": [], "assets": [], "vitals": {}}),
    );
    doc.insert(
        "character".into(),
        json!({
            "name": "User",
            "className": "Adventurer",
            "level": 1,
            "stats": {
                "str": 10, "dex": 10, "con": 10, "int": 10, "wis": 10, "cha": 10,
                "per": 10, "luk": 10, "agi": 10, "vit": 10, "end": 10, "spi": 10
            },
            "statusEffects": []
        }),
    );
    for (key, value) in [
        ("currency", 0),
        ("xp", 0),
        ("hp", 100),
        ("maxHp", 100),
        ("mp", 50),
        ("maxMp", 50),
        ("ap", 10),
        ("maxAp", 10),
    ] {
        doc.insert(key.into(), json!(value));
    }
    for key in ["calendar", "map", "social", "diary", "databank", "activities"] {
        doc.insert(key.into(), json!({}));
    }
}

pub struct ChatPartitioner {
    accessor: Arc<SettingsAccessor>,
    host: Arc<dyn HostBridge>,
    observers: Arc<Observers>,
    last_conversation_id: Mutex<Option<String>>,
    observed: AtomicBool,
}

impl ChatPartitioner {
    pub fn new(
        accessor: Arc<SettingsAccessor>,
        host: Arc<dyn HostBridge>,
        observers: Arc<Observers>,
    ) -> Arc<Self> {
        Arc::new(Self {
            accessor,
            host,
            observers,
            last_conversation_id: Mutex::new(None),
            observed: AtomicBool::new(false),
        })
    }

    fn last(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_conversation_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_conversation_id(&self) -> Option<String> {
        self.last().clone()
    }

    /// One poll step. Returns true when a conversation was loaded.
    pub fn check_and_load(&self) -> bool {
        let current = self.host.active_conversation_id();
        let first = !self.observed.swap(true, Ordering::SeqCst);
        let previous = self.last_conversation_id();

        if first {
            if current.is_none() {
                return false;
            }
        } else if current == previous {
            return false;
        } else {
            tracing::info!("conversation changed: {previous:?} -> {current:?}");
        }
        self.load_chat_state(current, first);
        true
    }

    /// Archive the outgoing session and install the one for `conversation_id`.
    ///
    /// On the very first observation there is no outgoing session. A document
    /// without any archive predates partitioning, so its live state is adopted
    /// by the conversation; otherwise an unseen conversation starts fresh.
    pub fn load_chat_state(&self, conversation_id: Option<String>, first_observation: bool) {
        let live = self.accessor.get();
        {
            let mut last = self.last();
            let mut doc = lock(&live);

            if let Some(previous) = last.as_deref() {
                if conversation_id.as_deref() != Some(previous) {
                    archive_session(&mut doc, previous);
                }
            }
            *last = conversation_id.clone();

            let Some(id) = conversation_id.as_deref() else {
                return;
            };
            match archived_session(&doc, id) {
                Some(saved) => restore_session(&mut doc, &saved),
                None if first_observation && !has_archives(&doc) => archive_session(&mut doc, id),
                None => clear_session(&mut doc),
            }
        }

        match self.accessor.sanitize_settings() {
            Ok(()) => {}
            Err(SettingsError::NotHydrated) => {
                tracing::debug!("settings not hydrated yet, defaults deferred")
            }
            Err(e) => tracing::warn!("sanitizing after chat switch failed: {e}"),
        }
        self.accessor.persist();
        self.observers.emit(StateEvent::ChatLoaded { conversation_id });
    }

    /// Replace the active conversation's state with fresh values.
    pub fn reset_current_chat(&self) {
        {
            let live = self.accessor.get();
            reset_session(&mut lock(&live));
        }
        self.accessor.persist();
        self.observers.emit(StateEvent::ChatReset);
    }
}

impl PersistHook for ChatPartitioner {
    fn before_persist(&self, live: &SharedDocument) {
        let last = self.last();
        if let Some(id) = last.as_deref() {
            archive_session(&mut lock(live), id);
        }
    }
}

/// Wait (20 x 100ms) for the host to come up before the first conversation
/// check.
pub async fn ensure_chat_state_loaded(host: &dyn HostBridge) -> bool {
    if host.settings_store_available() {
        return true;
    }
    retry::wait_until(&RetryPolicy::fixed(20, 100), "host context", || {
        host.settings_store_available()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::host::MemoryHost;
    use crate::mirror::MirrorManager;
    use crate::storage::{MemoryDurableStore, MemoryStorage};
    use pretty_assertions::assert_eq;

    fn setup(conversation: Option<&str>) -> (Arc<MemoryHost>, Arc<SettingsAccessor>, Arc<ChatPartitioner>) {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        host.set_conversation(conversation);
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mirror = Arc::new(MirrorManager::new(
            Arc::new(MemoryStorage::new(1 << 20)),
            Arc::new(MemoryDurableStore::new()),
            host.clone(),
            clock.clone(),
        ));
        let observers = Arc::new(Observers::new());
        let accessor = SettingsAccessor::new(
            EngineConfig::default(),
            host.clone(),
            mirror,
            clock,
            observers.clone(),
        );
        let partitioner = ChatPartitioner::new(accessor.clone(), host.clone(), observers);
        accessor.add_persist_hook(partitioner.clone());
        (host, accessor, partitioner)
    }

    fn hp(accessor: &SettingsAccessor) -> Option<Value> {
        lock(&accessor.get()).get("hp").cloned()
    }

    #[tokio::test]
    async fn test_switch_archives_and_restores() {
        let (host, accessor, partitioner) = setup(Some("chat1"));
        assert!(partitioner.check_and_load());
        lock(&accessor.get()).insert("hp".into(), json!(80));
        accessor.persist();

        host.set_conversation(Some("chat2"));
        assert!(partitioner.check_and_load());
        assert_eq!(hp(&accessor), None);
        {
            let live = accessor.get();
            let doc = lock(&live);
            assert_eq!(doc["chats"]["chat1"]["hp"], json!(80));
        }

        host.set_conversation(Some("chat1"));
        assert!(partitioner.check_and_load());
        assert_eq!(hp(&accessor), Some(json!(80)));
    }

    #[tokio::test]
    async fn test_no_change_is_a_no_op() {
        let (_host, _accessor, partitioner) = setup(Some("chat1"));
        assert!(partitioner.check_and_load());
        assert!(!partitioner.check_and_load());
        assert_eq!(partitioner.last_conversation_id().as_deref(), Some("chat1"));
    }

    #[tokio::test]
    async fn test_legacy_document_is_adopted_on_first_observation() {
        let (_host, accessor, partitioner) = setup(Some("chat1"));
        lock(&accessor.get()).insert("diary".into(), json!({"day1": "hello"}));
        partitioner.check_and_load();
        let live = accessor.get();
        let doc = lock(&live);
        assert_eq!(doc["diary"]["day1"], json!("hello"));
        assert_eq!(doc["chats"]["chat1"]["diary"]["day1"], json!("hello"));
    }

    #[tokio::test]
    async fn test_reload_into_unseen_chat_starts_fresh() {
        let (_host, accessor, partitioner) = setup(Some("chat2"));
        lock(&accessor.get()).extend(
            json!({
                "hp": 80,
                "inventory": {"items": [{"name": "Torch"}]},
                "chats": {"chat1": {"hp": 80, "inventory": {"items": [{"name": "Torch"}]}}}
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        assert!(partitioner.check_and_load());

        let live = accessor.get();
        let doc = lock(&live);
        assert_eq!(doc.get("hp"), None);
        assert_eq!(doc["inventory"]["items"], json!([]));
        assert_eq!(doc["chats"]["chat1"]["hp"], json!(80));
        assert_eq!(doc["chats"]["chat2"].get("hp"), None);
    }

    #[tokio::test]
    async fn test_leaving_to_no_conversation_archives_only() {
        let (host, accessor, partitioner) = setup(Some("chat1"));
        partitioner.check_and_load();
        lock(&accessor.get()).insert("xp".into(), json!(12));

        host.set_conversation(None);
        assert!(partitioner.check_and_load());
        let live = accessor.get();
        let doc = lock(&live);
        assert_eq!(doc["chats"]["chat1"]["xp"], json!(12));
        assert_eq!(doc["xp"], json!(12));
    }

    #[tokio::test]
    async fn test_global_keys_are_never_archived() {
        let mut doc = json!({"hp": 1, "savedStates": {"a": {}}, "windows": {}, "ui": {}})
            .as_object()
            .cloned()
            .unwrap();
        archive_session(&mut doc, "c");
        let saved = doc["chats"]["c"].as_object().unwrap();
        assert_eq!(saved.keys().collect::<Vec<_>>(), vec!["hp"]);
    }

    #[tokio::test]
    async fn test_reset_current_chat() {
        let (_host, accessor, partitioner) = setup(Some("chat1"));
        partitioner.check_and_load();
        lock(&accessor.get()).insert("currency".into(), json!(999));
        partitioner.reset_current_chat();

        let live = accessor.get();
        let doc = lock(&live);
        assert_eq!(doc["currency"], json!(0));
        assert_eq!(doc["character"]["stats"]["luk"], json!(10));
        assert_eq!(doc["chats"]["chat1"]["currency"], json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_chat_state_loaded_gives_up() {
        let host = MemoryHost::new();
        assert!(!ensure_chat_state_loaded(&host).await);
        host.hydrate(None);
        assert!(ensure_chat_state_loaded(&host).await);
    }
}
