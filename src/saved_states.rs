use std::sync::Arc;

use serde_json::{Map, Value};

use crate::accessor::SettingsAccessor;
use crate::clock::Clock;
use crate::document::lock;
use crate::error::{Result, SettingsError};
use crate::events::{Observers, StateEvent};
use crate::util::format_timestamp;

const SAVED_STATES_KEY: &str = "savedStates";

/// Named snapshots of the whole document kept inside the document itself.
pub struct SavedStates {
    accessor: Arc<SettingsAccessor>,
    observers: Arc<Observers>,
    clock: Arc<dyn Clock>,
}

impl SavedStates {
    pub fn new(accessor: Arc<SettingsAccessor>, observers: Arc<Observers>, clock: Arc<dyn Clock>) -> Self {
        Self {
            accessor,
            observers,
            clock,
        }
    }

    /// Snapshot everything except the saved states themselves under `name`
    /// (a timestamped default when blank). Returns the name used.
    pub fn save_state(&self, name: &str) -> String {
        let name = match name.trim() {
            "" => format!("Manual Save {}", format_timestamp(self.clock.now_millis() / 1000)),
            trimmed => trimmed.to_string(),
        };
        {
            let live = self.accessor.get();
            let mut doc = lock(&live);
            let mut snapshot = doc.clone();
            snapshot.remove(SAVED_STATES_KEY);

            let states = doc
                .entry(SAVED_STATES_KEY)
                .or_insert_with(|| Value::Object(Map::new()));
            if !states.is_object() {
                *states = Value::Object(Map::new());
            }
            if let Value::Object(states) = states {
                states.insert(name.clone(), Value::Object(snapshot));
            }
        }
        self.accessor.persist();
        self.observers.emit(StateEvent::SavedStatesChanged);
        name
    }

    /// Copy a saved snapshot's keys back over the live document.
    pub fn load_state(&self, name: &str) -> Result<()> {
        {
            let live = self.accessor.get();
            let mut doc = lock(&live);
            let saved = doc
                .get(SAVED_STATES_KEY)
                .and_then(|s| s.get(name))
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| SettingsError::UnknownState(name.to_string()))?;
            for (key, value) in saved {
                if key != SAVED_STATES_KEY {
                    doc.insert(key, value);
                }
            }
        }
        self.accessor.touch();
        self.accessor.persist();
        self.observers.emit(StateEvent::StateLoaded {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn delete_state(&self, name: &str) -> Result<()> {
        let removed = {
            let live = self.accessor.get();
            let mut doc = lock(&live);
            doc.get_mut(SAVED_STATES_KEY)
                .and_then(Value::as_object_mut)
                .and_then(|states| states.remove(name))
                .is_some()
        };
        if !removed {
            return Err(SettingsError::UnknownState(name.to_string()));
        }
        self.accessor.persist();
        self.observers.emit(StateEvent::SavedStatesChanged);
        Ok(())
    }

    /// Saved state names, sorted.
    pub fn list_states(&self) -> Vec<String> {
        let live = self.accessor.get();
        let doc = lock(&live);
        let mut names: Vec<String> = doc
            .get(SAVED_STATES_KEY)
            .and_then(Value::as_object)
            .map(|states| states.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
