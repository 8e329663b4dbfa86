//! Canonical JSON serialization
//!
//! Canonical form: object keys sorted, no insignificant whitespace, strings
//! normalized to Unicode NFC, numbers rendered by serde_json's shortest-form
//! formatter (ryu/itoa, platform independent). Two logically equal values
//! always produce identical bytes, which is what makes content hashes stable
//! across processes and machines.

use serde_json::{Map, Value};
use unicode_normalization::{is_nfc, UnicodeNormalization};

/// Rewrite a JSON value into canonical form.
///
/// Strings (including object keys) are normalized to NFC. Object key order is
/// handled by `serde_json::Map` itself, which keeps keys sorted.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(nfc(s)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(nfc(key), canonicalize(item));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Serialize a JSON value to canonical bytes.
pub fn canonical_json_bytes(value: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&canonicalize(value))
}

/// Serialize a JSON value to a canonical string.
pub fn canonical_json_string(value: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&canonicalize(value))
}

fn nfc(s: &str) -> String {
    if is_nfc(s) {
        s.to_string()
    } else {
        s.nfc().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_stable() {
        let a = json!({"b": 1, "a": 2, "c": {"z": 0, "y": 1}});
        let b = json!({"c": {"y": 1, "z": 0}, "a": 2, "b": 1});

        assert_eq!(
            canonical_json_bytes(&a).unwrap(),
            canonical_json_bytes(&b).unwrap()
        );
    }

    #[test]
    fn test_no_whitespace() {
        let value = json!({"words": ["a", "b"], "n": 3});
        let text = canonical_json_string(&value).unwrap();
        assert!(!text.contains(' '));
        assert_eq!(text, r#"{"n":3,"words":["a","b"]}"#);
    }

    #[test]
    fn test_nfc_normalization() {
        // "é" as a single code point vs "e" + combining acute accent
        let composed = json!({ "word": "caf\u{e9}" });
        let decomposed = json!({ "word": "cafe\u{301}" });

        assert_eq!(
            canonical_json_bytes(&composed).unwrap(),
            canonical_json_bytes(&decomposed).unwrap()
        );
    }

    #[test]
    fn test_array_order_is_preserved() {
        let a = json!({"vocab": ["a", "b"]});
        let b = json!({"vocab": ["b", "a"]});
        assert_ne!(
            canonical_json_bytes(&a).unwrap(),
            canonical_json_bytes(&b).unwrap()
        );
    }
}
