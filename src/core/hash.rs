//! Content hashing and cache key derivation
//!
//! All hashes are lowercase-hex SHA-256. Content hashes are computed over
//! canonical JSON bytes so that logically equal content always hashes the
//! same way regardless of how the caller assembled it.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::canonical::canonical_json_bytes;

/// Lowercase-hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a JSON value: `sha256(canonical_json(content))`.
pub fn content_hash(content: &Value) -> serde_json::Result<String> {
    Ok(sha256_hex(&canonical_json_bytes(content)?))
}

/// Deterministic key for externally stored resource content.
///
/// `sha256(resource_id || ":content:" || data_hash)`
pub fn resource_content_key(resource_id: &str, data_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_id.as_bytes());
    hasher.update(b":content:");
    hasher.update(data_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// General cache key: `sha256(namespace || ":" || parts joined by ":")`.
pub fn general_cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(parts.join(":").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_is_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_content_hash_is_lowercase_hex() {
        let hash = content_hash(&json!({"a": 1})).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_resource_content_key_is_deterministic() {
        let k1 = resource_content_key("corpus:en", "abc123");
        let k2 = resource_content_key("corpus:en", "abc123");
        let k3 = resource_content_key("corpus:en", "abc124");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_general_cache_key_joins_parts() {
        let a = general_cache_key("corpus", &["en", "latest"]);
        let b = general_cache_key("corpus", &["en:latest"]);
        // Joining with ":" means these collide by construction; callers pick
        // parts that do not themselves contain the separator.
        assert_eq!(a, b);
        assert_ne!(a, general_cache_key("search", &["en", "latest"]));
    }
}
