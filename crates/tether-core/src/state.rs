//! # State Trees
//!
//! Shadow state is a JSON object tree. Updates are partial documents merged
//! key by key; a `null` leaf removes the key.
//!
//! ```text
//!   current                patch                    merged
//!   { "a": 1,          +   { "a": 2,           =    { "a": 2,
//!     "b": { "x": 1 },       "b": { "y": 2 },         "b": { "x": 1, "y": 2 } }
//!     "c": true }            "c": null }
//! ```
//!
//! The delta of `desired` against `reported` is every leaf of `desired` whose
//! value is missing from or different in `reported`, keeping the tree shape.

use serde_json::{Map, Value};

/// Merges `patch` into `target` in place.
///
/// Objects merge recursively, `null` deletes, anything else replaces.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

/// Computes the part of `desired` not reflected in `reported`.
///
/// Returns `None` when every desired leaf already matches.
pub fn delta(desired: &Value, reported: &Value) -> Option<Value> {
    match (desired, reported) {
        (Value::Object(want), Value::Object(have)) => {
            let mut out = Map::new();
            for (key, value) in want {
                if value.is_null() {
                    continue;
                }
                let diff = match have.get(key) {
                    Some(current) => delta(value, current),
                    None => Some(value.clone()),
                };
                if let Some(diff) = diff {
                    out.insert(key.clone(), diff);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        (Value::Object(want), _) if want.is_empty() => None,
        (want, have) if want == have => None,
        (want, _) => Some(want.clone()),
    }
}

/// Returns true when `value` is `null` or an empty object.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
