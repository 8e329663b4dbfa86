//! # Versioned Content-Addressable Records
//!
//! The cold half of the storage stack:
//! - `record`: the polymorphic `VersionedRecord` document model
//! - `content`: inline-vs-external content placement with checksums
//! - `coldstore`: the persistent document collection with secondary indexes
//! - `locks`: the per-resource lock table
//! - `manager`: the version manager (save/dedup/chains/retention/delete)
//!
//! Every resource is identified by `(resource_type, resource_id)` and owns a
//! totally ordered version chain. Content is addressed by the SHA-256 of its
//! canonical JSON; saving identical content is idempotent.

pub mod coldstore;
pub mod content;
pub mod locks;
pub mod manager;
pub mod record;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use coldstore::ColdStore;
pub use content::ContentStore;
pub use locks::ResourceLockTable;
pub use manager::VersionManager;
pub use record::{ContentLocation, ResourceType, SaveOptions, VersionInfo, VersionedRecord};

use crate::cache::CacheError;

/// Versioning error types
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// Per-resource lock could not be acquired in time
    #[error("Lock acquisition timed out for {resource}")]
    LockTimeout {
        /// The `(resource_type, resource_id)` pair that was contended
        resource: String,
    },

    /// Requested version does not advance the chain
    #[error("Version conflict: requested {requested}, current latest is {current}")]
    VersionConflict {
        /// Version the caller asked for
        requested: String,
        /// Version currently at the head of the chain
        current: String,
    },

    /// Cold-store write failure
    #[error("Persist error: {0}")]
    Persist(String),

    /// Cold-store backend failure with the cause preserved
    #[error("Cold store backend error: {0}")]
    Backend(#[from] sled::Error),

    /// Failure in the two-tier cache holding external content
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// External content bytes are gone from the warm tier
    #[error("Content missing for key {key}")]
    ContentMissing {
        /// Cache key the content was stored under
        key: String,
    },

    /// External content bytes fail their checksum
    #[error("Content corrupt: expected hash {expected}, got {actual}")]
    ContentCorrupt {
        /// Checksum recorded at store time
        expected: String,
        /// Checksum computed from the loaded bytes
        actual: String,
    },

    /// A stored record violates its own invariants
    #[error("Corrupt record: {0}")]
    Corruption(String),

    /// Malformed caller input, rejected before any mutation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for versioning operations
pub type Result<T> = std::result::Result<T, VersionError>;

/// Progress event emitted by long-running operations.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Operation stage label
    pub stage: &'static str,
    /// Completion fraction in `[0, 1]`
    pub fraction: f32,
    /// Human-readable detail
    pub message: String,
}

/// Optional progress callback. Callers who do not supply one pay nothing.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Version manager configuration
#[derive(Debug, Clone)]
pub struct VersionConfig {
    /// Per-resource lock acquisition timeout
    pub lock_timeout: Duration,
    /// Content at or above this canonical size is stored externally
    pub inline_threshold: usize,
    /// Default number of versions kept per resource by retention sweeps
    pub retention_default: usize,
    /// Per-resource-type retention overrides
    pub retention_per_type: HashMap<ResourceType, usize>,
    /// Move corrupt cold-store documents into the quarantine tree on read
    pub quarantine_corrupt: bool,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            inline_threshold: 16 * 1024,
            retention_default: 3,
            retention_per_type: HashMap::new(),
            quarantine_corrupt: true,
        }
    }
}

impl VersionConfig {
    /// Retention count for a resource type.
    pub fn retention_for(&self, resource_type: ResourceType) -> usize {
        self.retention_per_type
            .get(&resource_type)
            .copied()
            .unwrap_or(self.retention_default)
    }
}
