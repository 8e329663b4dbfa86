//! # LEXARC - Versioned Corpus Cache and Search Core
//!
//! The storage and retrieval core of a dictionary/corpus system, built in Rust.
//!
//! ## Architecture
//!
//! - `core`: Canonical JSON, content hashing, and cache key derivation
//! - `cache`: Two-tier (memory + disk) namespace-partitioned cache with compression
//! - `versioning`: Content-addressable versioned records over a cold document store
//! - `corpus`: Vocabulary storage, normalization, and corpus tree management
//! - `search`: Exact, prefix, fuzzy, and semantic retrieval with a cascading
//!   orchestrator, hot reload, and non-blocking semantic index construction

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules - hashing and canonical serialization
pub mod core;

// Two-tier cache (memory LRU + sled disk tier)
pub mod cache;

// Versioned content-addressable records
pub mod versioning;

// Corpus management
pub mod corpus;

// Multi-method search
pub mod search;

// Re-export commonly used types
pub use crate::core::{canonical_json_bytes, content_hash, general_cache_key, resource_content_key};
pub use cache::{CacheConfig, CacheError, CacheManager, CacheStatsSnapshot, Namespace};
pub use corpus::{CorpusConfig, CorpusEntity, CorpusError, CorpusManager};
pub use search::{
    SearchError, SearchMode, SearchOptions, SearchResponse, SearchResult, SearchService,
};
pub use versioning::{
    ResourceType, SaveOptions, VersionConfig, VersionError, VersionManager, VersionedRecord,
};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
