//! # Two-Tier Namespace-Partitioned Cache
//!
//! Provides the hot/warm storage stack used by the versioning core:
//! - Memory tier: per-namespace LRU with per-entry TTL (fastest, bounded)
//! - Disk tier: persistent sled-backed KV store, TTL-aware, size-capped
//!
//! Values are JSON documents. Writes serialize to canonical JSON (sorted
//! keys) so that content hashes computed over cached bytes are stable, then
//! compress per namespace policy before hitting the disk tier. Reads check
//! memory first and promote warm disk hits back into memory.

pub mod codec;
pub mod disk;
pub mod manager;
pub mod memory;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use codec::{CodecConfig, CodecError, CompressionAlgorithm};
pub use disk::DiskCache;
pub use manager::{CacheManager, CacheStatsSnapshot};
pub use memory::MemoryCache;

/// Cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Disk-tier write failure. Surfaced to the caller; never swallowed.
    #[error("Cache write failed: {0}")]
    WriteFailed(String),

    /// Backend (sled) failure with the original cause preserved.
    #[error("Cache backend error: {0}")]
    Backend(#[from] sled::Error),

    /// Compression codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary frame encoding error
    #[error("Frame encoding error: {0}")]
    Frame(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input rejected before any mutation
    #[error("Invalid cache input: {0}")]
    InvalidInput(String),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache partition label.
///
/// Closed enum: every versioned resource type maps to exactly one namespace,
/// and every namespace carries its own limits and compression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Corpus documents (vocabulary and derived maps)
    Corpus,
    /// Search index manifests
    Search,
    /// Serialized trie + bloom payloads
    Trie,
    /// Semantic embeddings and ANN payloads
    Semantic,
    /// Everything else
    Default,
}

impl Namespace {
    /// All namespaces, in declaration order.
    pub const ALL: [Namespace; 5] = [
        Namespace::Corpus,
        Namespace::Search,
        Namespace::Trie,
        Namespace::Semantic,
        Namespace::Default,
    ];

    /// Stable label used in disk tree names and cache keys.
    pub fn label(&self) -> &'static str {
        match self {
            Namespace::Corpus => "corpus",
            Namespace::Search => "search",
            Namespace::Trie => "trie",
            Namespace::Semantic => "semantic",
            Namespace::Default => "default",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-namespace cache policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Maximum number of entries held in memory
    pub memory_limit: usize,
    /// Memory-tier TTL (None = no expiry)
    pub memory_ttl: Option<Duration>,
    /// Disk-tier TTL (None = no expiry)
    pub disk_ttl: Option<Duration>,
    /// Compression applied to disk-tier payloads
    pub compression: CompressionAlgorithm,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            memory_limit: 1024,
            memory_ttl: Some(Duration::from_secs(600)),
            disk_ttl: Some(Duration::from_secs(86_400)),
            compression: CompressionAlgorithm::None,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disk-tier directory
    pub directory: PathBuf,
    /// Disk-tier size cap in bytes
    pub max_disk_bytes: u64,
    /// Background TTL reaper interval
    pub reaper_interval: Duration,
    /// Codec tuning (compression level, minimum gain)
    pub codec: CodecConfig,
    /// Per-namespace overrides; namespaces absent here use built-in defaults
    pub namespaces: HashMap<Namespace, NamespaceConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./lexarc-cache"),
            max_disk_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
            reaper_interval: Duration::from_secs(300),
            codec: CodecConfig::default(),
            namespaces: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Resolve the effective policy for a namespace.
    pub fn namespace(&self, ns: Namespace) -> NamespaceConfig {
        if let Some(cfg) = self.namespaces.get(&ns) {
            return cfg.clone();
        }
        match ns {
            Namespace::Corpus => NamespaceConfig {
                memory_limit: 256,
                memory_ttl: Some(Duration::from_secs(3600)),
                disk_ttl: Some(Duration::from_secs(7 * 86_400)),
                compression: CompressionAlgorithm::Zstd,
            },
            Namespace::Search => NamespaceConfig {
                memory_limit: 512,
                memory_ttl: Some(Duration::from_secs(1800)),
                disk_ttl: Some(Duration::from_secs(86_400)),
                compression: CompressionAlgorithm::Lz4,
            },
            Namespace::Trie => NamespaceConfig {
                memory_limit: 64,
                memory_ttl: Some(Duration::from_secs(3600)),
                disk_ttl: Some(Duration::from_secs(7 * 86_400)),
                compression: CompressionAlgorithm::Zstd,
            },
            Namespace::Semantic => NamespaceConfig {
                memory_limit: 32,
                memory_ttl: Some(Duration::from_secs(7200)),
                disk_ttl: Some(Duration::from_secs(7 * 86_400)),
                compression: CompressionAlgorithm::Zstd,
            },
            Namespace::Default => NamespaceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_labels_are_unique() {
        let labels: std::collections::HashSet<_> =
            Namespace::ALL.iter().map(|ns| ns.label()).collect();
        assert_eq!(labels.len(), Namespace::ALL.len());
    }

    #[test]
    fn test_namespace_override_wins() {
        let mut config = CacheConfig::default();
        config.namespaces.insert(
            Namespace::Corpus,
            NamespaceConfig {
                memory_limit: 7,
                ..NamespaceConfig::default()
            },
        );
        assert_eq!(config.namespace(Namespace::Corpus).memory_limit, 7);
        // Untouched namespaces keep their built-in defaults
        assert_eq!(config.namespace(Namespace::Trie).memory_limit, 64);
    }
}
