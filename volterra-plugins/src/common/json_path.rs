//! Dot-path lookups into JSON-like trees

use serde_json::Value;

/// Follow a dot-separated path such as `data.atoms.0.position`
///
/// Object segments match keys; numeric segments index into arrays. An empty
/// path returns the value itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_object_and_array() {
        let value = json!({"data": {"atoms": [{"id": 1}, {"id": 2}]}});
        assert_eq!(lookup_path(&value, "data.atoms.1.id"), Some(&json!(2)));
        assert_eq!(lookup_path(&value, ""), Some(&value));
    }

    #[test]
    fn test_lookup_missing_segment() {
        let value = json!({"data": [1, 2]});
        assert_eq!(lookup_path(&value, "data.5"), None);
        assert_eq!(lookup_path(&value, "data.x"), None);
        assert_eq!(lookup_path(&value, "other"), None);
    }
}
