use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Produce a canonical JSON string with object keys sorted recursively.
/// This ensures cache keys are stable regardless of key insertion order.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Normalize an argument map for cache-key derivation and batch dedup:
/// recursive key sort plus removal of object keys whose value is `null`,
/// so `{"a": 1, "b": null}` and `{"a": 1}` address the same entry.
pub fn canonicalize_arguments(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, canonicalize_arguments(v)))
                .collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_arguments).collect()),
        other => other.clone(),
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"z": 1, "a": 2, "m": 3});
        let b = json!({"a": 2, "m": 3, "z": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn canonical_json_nested_objects() {
        let a = json!({"outer": {"z": 1, "a": 2}});
        let b = json!({"outer": {"a": 2, "z": 1}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn canonical_json_arrays_preserved() {
        // Arrays preserve order (not sorted)
        let a = json!({"items": [3, 1, 2]});
        let b = json!({"items": [1, 2, 3]});
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn canonicalize_drops_null_keys() {
        let a = json!({"a": 1, "b": null});
        let b = json!({"a": 1});
        assert_eq!(
            canonical_json(&canonicalize_arguments(&a)),
            canonical_json(&canonicalize_arguments(&b))
        );
    }

    #[test]
    fn canonicalize_drops_nested_nulls() {
        let a = json!({"outer": {"keep": "x", "drop": null}});
        let b = json!({"outer": {"keep": "x"}});
        assert_eq!(
            canonical_json(&canonicalize_arguments(&a)),
            canonical_json(&canonicalize_arguments(&b))
        );
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(sha256_hex("abc"), sha256_hex("abc"));
        assert_ne!(sha256_hex("abc"), sha256_hex("abd"));
        assert_eq!(sha256_hex("abc").len(), 64);
    }
}
