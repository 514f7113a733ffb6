//! Merging of chunked values into one tree

use serde_json::{Map, Value};

/// Merge `incoming` into `target`
///
/// - `incoming` null leaves `target` untouched; a null `target` is replaced.
/// - Two arrays concatenate in order.
/// - Two objects merge key by key: arrays concatenate, objects recurse, and
///   anything else from `incoming` replaces the existing value.
/// - Any other combination replaces `target` with `incoming`.
pub fn merge_chunked_value(target: &mut Value, incoming: Value) {
    if incoming.is_null() {
        return;
    }
    match (target, incoming) {
        (Value::Array(existing), Value::Array(items)) => existing.extend(items),
        (Value::Object(existing), Value::Object(entries)) => merge_objects(existing, entries),
        (target, incoming) => *target = incoming,
    }
}

fn merge_objects(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        let Some(existing) = target.get_mut(&key) else {
            target.insert(key, value);
            continue;
        };
        match (existing, value) {
            (Value::Array(existing), Value::Array(items)) => existing.extend(items),
            (existing, value) if existing.is_object() && value.is_object() => {
                merge_chunked_value(existing, value)
            }
            (existing, value) => *existing = value,
        }
    }
}

/// Owned convenience form of [`merge_chunked_value`]
pub fn merged(mut target: Value, incoming: Value) -> Value {
    merge_chunked_value(&mut target, incoming);
    target
}

/// Copy of a message with every array-valued field removed, recursively
///
/// Arrays inside arrays are irrelevant because arrays are dropped whole.
/// A top-level array strips to null.
pub fn strip_arrays(value: &Value) -> Value {
    match value {
        Value::Array(_) => Value::Null,
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_array())
                .map(|(k, v)| (k.clone(), strip_arrays(v)))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}
