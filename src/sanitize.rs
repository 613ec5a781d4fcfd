use serde_json::{Map, Value};

use crate::document::Document;

pub const DEFAULT_UI_SCALE: f64 = 0.8;

const FEATURE_TOGGLES: [&str; 7] = ["map", "doll", "social", "phoneBg", "msg", "party", "items"];

/// Ensure required sub-structures and default scalars exist.
///
/// Only fills gaps, never overwrites a present value of the right shape, so a
/// second call on the same document changes nothing. Returns whether anything
/// was added.
pub fn apply_defaults(doc: &mut Document) -> bool {
    let mut changed = false;

    let inventory = object_entry(doc, "inventory", &mut changed);
    if !inventory.get("items").is_some_and(Value::is_array) {
        inventory.insert("items".into(), Value::Array(Vec::new()));
        changed = true;
    }
    object_entry(inventory, "equipment", &mut changed);
    let vitals = object_entry(inventory, "vitals", &mut changed);
    for (key, default) in [
        ("hp", 100),
        ("maxHp", 100),
        ("mp", 50),
        ("maxMp", 50),
        ("sp", 50),
        ("maxSp", 50),
        ("xp", 0),
        ("level", 1),
    ] {
        if !vitals.get(key).is_some_and(Value::is_number) {
            vitals.insert(key.into(), Value::from(default));
            changed = true;
        }
    }
    for (key, default) in [("name", "Traveler"), ("class", "Adventurer")] {
        if !vitals.get(key).is_some_and(non_blank) {
            vitals.insert(key.into(), Value::from(default));
            changed = true;
        }
    }

    if !doc.get("currencySymbol").is_some_and(non_blank) {
        doc.insert("currencySymbol".into(), Value::from("G"));
        changed = true;
    }
    if !doc.get("currencyRate").is_some_and(Value::is_number) {
        doc.insert("currencyRate".into(), Value::from(1));
        changed = true;
    }

    let image = object_entry(doc, "image", &mut changed);
    let features = object_entry(image, "features", &mut changed);
    for toggle in FEATURE_TOGGLES {
        if !features.contains_key(toggle) {
            features.insert(toggle.into(), Value::Bool(true));
            changed = true;
        }
    }

    object_entry(doc, "windows", &mut changed);

    let raw_scale = doc
        .get("ui")
        .and_then(|ui| ui.get("scale"))
        .or_else(|| doc.get("uiScale"))
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && *s > 0.0);
    let scale = raw_scale.unwrap_or(DEFAULT_UI_SCALE);
    let ui = object_entry(doc, "ui", &mut changed);
    if raw_scale.is_none() || !ui.get("scale").is_some_and(is_positive_number) {
        if ui.get("scale").and_then(Value::as_f64) != Some(scale) {
            ui.insert("scale".into(), Value::from(scale));
            changed = true;
        }
    }
    if raw_scale.is_none() || !doc.get("uiScale").is_some_and(is_positive_number) {
        if doc.get("uiScale").and_then(Value::as_f64) != Some(scale) {
            doc.insert("uiScale".into(), Value::from(scale));
            changed = true;
        }
    }

    changed
}

/// Get `key` as an object, replacing a missing or malformed value with `{}`.
fn object_entry<'a>(doc: &'a mut Map<String, Value>, key: &str, changed: &mut bool) -> &'a mut Map<String, Value> {
    let slot = doc.entry(key).or_insert_with(|| {
        *changed = true;
        Value::Object(Map::new())
    });
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
        *changed = true;
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just made an object"),
    }
}

fn non_blank(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty(),
        Value::Null | Value::Bool(false) => false,
        _ => true,
    }
}

fn is_positive_number(value: &Value) -> bool {
    value.as_f64().is_some_and(|f| f.is_finite() && f > 0.0)
}
