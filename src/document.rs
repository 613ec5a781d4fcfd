//! The settings document: one loosely typed JSON object per installation.
//!
//! Every self-preservation decision in the engine (never persist over, never
//! restore from, never stamp defaults onto) goes through [`looks_empty`] and
//! [`has_user_data`], re-derived from the document each time it is needed.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

/// The live document handed to every consumer. All holders see the same object.
pub type SharedDocument = Arc<Mutex<Document>>;

/// Write timestamp used for staleness arbitration.
pub const SAVED_AT_KEY: &str = "__uie_saved_at";
pub const SCHEMA_KEY: &str = "__uie_schema";
pub const SCHEMA_VERSION: u64 = 1;

/// Conversation-scoped keys, archived per chat on conversation switch.
///
/// `savedStates`, `windows`, `ui` and `launcher` are global and must never be
/// archived (archiving `savedStates` would nest every snapshot inside itself).
pub const SESSION_KEYS: [&str; 21] = [
    "inventory",
    "character",
    "currency",
    "currencySymbol",
    "currencyRate",
    "calendar",
    "map",
    "social",
    "diary",
    "databank",
    "activities",
    "xp",
    "hp",
    "mp",
    "ap",
    "maxHp",
    "maxMp",
    "maxAp",
    "maxXp",
    "life",
    "image",
];

/// Keys that are present on every sanitized document and carry no user data.
const BENIGN_KEYS: [&str; 9] = [
    "inventory",
    "image",
    "windows",
    "ui",
    "currencySymbol",
    "currencyRate",
    "uiScale",
    SAVED_AT_KEY,
    SCHEMA_KEY,
];

pub fn new_shared(doc: Document) -> SharedDocument {
    Arc::new(Mutex::new(doc))
}

/// Lock a shared document. A panicked writer leaves the JSON tree intact, so
/// poisoning is ignored.
pub fn lock(doc: &SharedDocument) -> MutexGuard<'_, Document> {
    doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn is_non_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| !o.is_empty())
}

fn non_empty_map(doc: &Document, key: &str) -> bool {
    doc.get(key).is_some_and(is_non_empty_object)
}

/// Non-empty object or array; some modules store their entries as a list.
fn non_empty_collection(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(list) => !list.is_empty(),
        _ => false,
    }
}

/// True when the document holds anything a user would miss.
pub fn has_user_data(doc: &Document) -> bool {
    let inventory_items = doc
        .get("inventory")
        .and_then(|inv| inv.get("items"))
        .and_then(Value::as_array)
        .is_some_and(|items| !items.is_empty());

    let calendar = doc
        .get("calendar")
        .and_then(|cal| cal.get("events"))
        .is_some_and(non_empty_collection);

    let map = doc.get("map").is_some_and(|map| {
        let image = map.get("image").is_some_and(truthy);
        let nodes = map
            .get("data")
            .and_then(|d| d.get("nodes"))
            .and_then(Value::as_array)
            .is_some_and(|n| !n.is_empty());
        image || nodes
    });

    let social = doc
        .get("social")
        .and_then(Value::as_object)
        .is_some_and(|groups| {
            groups
                .values()
                .any(|v| v.as_array().is_some_and(|a| !a.is_empty()))
        });

    inventory_items
        || non_empty_map(doc, "savedStates")
        || calendar
        || map
        || social
        || doc.get("diary").is_some_and(non_empty_collection)
        || doc.get("databank").is_some_and(non_empty_collection)
}

/// The looks-empty predicate: no user data and nothing beyond the benign
/// always-present keys.
pub fn looks_empty(doc: &Document) -> bool {
    if doc.is_empty() {
        return true;
    }
    if has_user_data(doc) {
        return false;
    }
    doc.keys().all(|k| BENIGN_KEYS.contains(&k.as_str()))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn saved_at(doc: &Document) -> u64 {
    doc.get(SAVED_AT_KEY).map(as_millis).unwrap_or(0)
}

pub fn stamp(doc: &mut Document, at: u64) {
    doc.insert(SAVED_AT_KEY.to_string(), Value::from(at));
}

/// Lenient numeric read: numbers and numeric strings, anything else is 0.
pub fn as_millis(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f.max(0.0) as u64).unwrap_or(0),
        _ => 0,
    }
}

/// Wholesale replace the contents of `target`, keeping the same object.
pub fn replace_contents(target: &mut Document, source: Document) {
    target.clear();
    target.extend(source);
}

/// Convert any serializable value into a document.
///
/// Values serde cannot represent are dropped; if the direct conversion fails
/// the value goes through a string round trip, and as a last resort an empty
/// document is returned so a persist is never aborted.
pub fn to_document<T: Serialize + ?Sized>(value: &T) -> Document {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Document::new(),
        Err(e) => {
            tracing::warn!("document conversion failed, retrying through text: {e}");
            serde_json::to_string(value)
                .ok()
                .and_then(|text| serde_json::from_str::<Document>(&text).ok())
                .unwrap_or_default()
        }
    }
}

/// Serialize a document, never failing.
pub fn safe_json(doc: &Document) -> String {
    serde_json::to_string(doc).unwrap_or_else(|e| {
        tracing::error!("failed to serialize settings: {e}");
        String::new()
    })
}

/// Sub-documents that consumers index into and therefore must be objects.
const OBJECT_KEYS: [&str; 6] = ["inventory", "image", "windows", "ui", "chats", "savedStates"];

/// One-time migration of a freshly loaded document to the current schema.
/// Returns true when anything changed.
pub fn migrate(doc: &mut Document) -> bool {
    let version = doc.get(SCHEMA_KEY).map(as_millis).unwrap_or(0);
    if version >= SCHEMA_VERSION {
        return false;
    }

    for key in OBJECT_KEYS {
        if let Some(value) = doc.get_mut(key) {
            if !value.is_object() {
                tracing::warn!("migrating malformed `{key}` to an empty object");
                *value = Value::Object(Map::new());
            }
        }
    }

    // Legacy documents kept the UI scale at the top level only.
    if let Some(scale) = doc.get("uiScale").and_then(Value::as_f64) {
        if scale.is_finite() && scale > 0.0 {
            let ui = doc
                .entry("ui")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(ui) = ui.as_object_mut() {
                ui.entry("scale").or_insert_with(|| Value::from(scale));
            }
        }
    }

    doc.insert(SCHEMA_KEY.to_string(), Value::from(SCHEMA_VERSION));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_empty_and_shell_documents_look_empty() {
        assert!(looks_empty(&Document::new()));
        assert!(looks_empty(&doc(json!({
            "inventory": {"items": []},
            "image": {"features": {"map": true}},
            "windows": {},
            "ui": {"scale": 0.8},
            "currencySymbol": "G",
            "currencyRate": 1,
            "__uie_saved_at": 5
        }))));
    }

    #[test]
    fn test_user_data_makes_document_non_empty() {
        let cases = [
            json!({"inventory": {"items": [{"name": "Torch"}]}}),
            json!({"savedStates": {"slot": {}}}),
            json!({"calendar": {"events": {"2024-01-01": []}}}),
            json!({"map": {"image": "data:png"}}),
            json!({"map": {"data": {"nodes": [1]}}}),
            json!({"social": {"friends": [{"name": "Ada"}]}}),
            json!({"diary": {"e1": "text"}}),
            json!({"databank": {"k": "v"}}),
            json!({"diary": [{"title": "Day 1", "text": "Arrived"}]}),
            json!({"databank": [{"key": "lore"}]}),
        ];
        for case in cases {
            let d = doc(case.clone());
            assert!(has_user_data(&d), "{case}");
            assert!(!looks_empty(&d), "{case}");
        }
    }

    #[test]
    fn test_empty_diary_list_is_not_user_data() {
        let d = doc(json!({"diary": [], "databank": {}}));
        assert!(!has_user_data(&d));
    }

    #[test]
    fn test_meaningful_key_without_user_data() {
        let d = doc(json!({"hp": 80}));
        assert!(!has_user_data(&d));
        assert!(!looks_empty(&d));
    }

    #[test]
    fn test_empty_social_groups_are_not_data() {
        let d = doc(json!({"social": {"friends": [], "rivals": []}}));
        assert!(!has_user_data(&d));
    }

    #[test]
    fn test_saved_at_accepts_strings() {
        assert_eq!(saved_at(&doc(json!({"__uie_saved_at": "1500"}))), 1500);
        assert_eq!(saved_at(&doc(json!({"__uie_saved_at": 1500.7}))), 1500);
        assert_eq!(saved_at(&doc(json!({"__uie_saved_at": null}))), 0);
        assert_eq!(saved_at(&Document::new()), 0);
    }

    #[test]
    fn test_migrate_repairs_and_is_one_shot() {
        let mut d = doc(json!({"inventory": "broken", "uiScale": 1.2}));
        assert!(migrate(&mut d));
        assert_eq!(d["inventory"], json!({}));
        assert_eq!(d["ui"]["scale"], json!(1.2));
        assert_eq!(d[SCHEMA_KEY], json!(SCHEMA_VERSION));
        assert!(!migrate(&mut d));
    }

    #[test]
    fn test_to_document_drops_non_objects() {
        assert!(to_document(&vec![1, 2]).is_empty());
        let d = to_document(&json!({"a": 1}));
        assert_eq!(d["a"], json!(1));
    }
}
