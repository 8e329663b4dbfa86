//! Core module - canonical serialization, content hashing, and key derivation
//!
//! These are the pure leaves of the crate: no I/O, no shared state. Every
//! content hash, dedup decision, and cache key in the system is derived here,
//! so the functions in this module must stay deterministic across platforms.

pub mod canonical;
pub mod hash;

// Re-export commonly used functions
pub use canonical::{canonical_json_bytes, canonical_json_string, canonicalize};
pub use hash::{content_hash, general_cache_key, resource_content_key, sha256_hex};
