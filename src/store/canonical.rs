//! Deterministic JSON canonicalisation and the state checksum.
//!
//! The checksum must be reproducible across runs and processes, so the
//! serialisation it is computed over is pinned here rather than delegated to
//! whatever `serde_json` happens to emit: object keys are sorted, arrays keep
//! their order, strings use serde_json's escaping, and numbers use
//! serde_json's canonical shortest representation. The `_checksum` field is
//! removed from the pre-image before hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Key under which the checksum is stored inside the state object.
pub const CHECKSUM_FIELD: &str = "_checksum";

/// Serialise a JSON value deterministically: sorted object keys, no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json's Display for Number is the shortest round-trippable
        // form for both integers and floats.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json::to_string on a &str cannot fail.
            out.push_str(&serde_json::to_string(s).expect("string serialisation"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("key serialisation"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 over the canonical serialisation of `value` with `_checksum`
/// removed, as a lowercase hex string.
pub fn state_checksum(value: &Value) -> String {
    let pre_image = match value {
        Value::Object(map) => {
            let mut clean = map.clone();
            clean.remove(CHECKSUM_FIELD);
            Value::Object(clean)
        }
        other => other.clone(),
    };
    let serialized = canonical_json(&pre_image);
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys() {
        let value = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        assert_eq!(canonical_json(&value), r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn test_canonical_preserves_array_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonical_json(&value), "[3,1,2]");
    }

    #[test]
    fn test_canonical_scalars() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(true)), "true");
        assert_eq!(canonical_json(&json!(42)), "42");
        assert_eq!(canonical_json(&json!(1.5)), "1.5");
        assert_eq!(canonical_json(&json!("a\"b")), r#""a\"b""#);
    }

    #[test]
    fn test_canonical_is_stable_across_key_insertion_order() {
        let a = json!({"x": 1, "y": 2});
        let mut map = serde_json::Map::new();
        map.insert("y".to_string(), json!(2));
        map.insert("x".to_string(), json!(1));
        let b = Value::Object(map);
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let without = json!({"phase": "PLAN", "heal_attempts": 0});
        let with = json!({"phase": "PLAN", "heal_attempts": 0, "_checksum": "deadbeef"});
        assert_eq!(state_checksum(&without), state_checksum(&with));
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = json!({"phase": "PLAN"});
        let b = json!({"phase": "EXECUTE"});
        assert_ne!(state_checksum(&a), state_checksum(&b));
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let sum = state_checksum(&json!({}));
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
