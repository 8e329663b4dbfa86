//! Versioned record data model
//!
//! Records are polymorphic on `ResourceType`: one document shape serves every
//! resource kind, with type-specific fields promoted into `metadata` by a
//! declared field list (no reflection). The cold store indexes a fixed set of
//! those metadata fields sparsely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::cache::{CompressionAlgorithm, Namespace};

/// Classification of a versioned resource.
///
/// Closed enum; each variant maps deterministically to one cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A corpus document (vocabulary plus derived maps)
    Corpus,
    /// A search index manifest
    SearchIndex,
    /// A serialized trie + bloom payload
    TrieIndex,
    /// A semantic embedding index
    SemanticIndex,
    /// Anything else
    Generic,
}

impl ResourceType {
    /// All resource types, in declaration order.
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Corpus,
        ResourceType::SearchIndex,
        ResourceType::TrieIndex,
        ResourceType::SemanticIndex,
        ResourceType::Generic,
    ];

    /// Stable label used in cold-store keys.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceType::Corpus => "corpus",
            ResourceType::SearchIndex => "search_index",
            ResourceType::TrieIndex => "trie_index",
            ResourceType::SemanticIndex => "semantic_index",
            ResourceType::Generic => "generic",
        }
    }

    /// The cache namespace backing this resource type's external content.
    pub fn namespace(&self) -> Namespace {
        match self {
            ResourceType::Corpus => Namespace::Corpus,
            ResourceType::SearchIndex => Namespace::Search,
            ResourceType::TrieIndex => Namespace::Trie,
            ResourceType::SemanticIndex => Namespace::Semantic,
            ResourceType::Generic => Namespace::Default,
        }
    }

    /// Content fields promoted into `metadata` on save so the cold store can
    /// index them. This is the declared schema that replaces runtime
    /// reflection over record subclasses.
    pub fn typed_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Corpus => &[
                "corpus_id",
                "corpus_name",
                "parent_corpus_id",
                "vocabulary_hash",
                "language",
            ],
            ResourceType::SearchIndex => &["corpus_id", "vocabulary_hash"],
            ResourceType::TrieIndex => &["corpus_id", "vocabulary_hash"],
            ResourceType::SemanticIndex => &[
                "corpus_id",
                "vocabulary_hash",
                "model_name",
                "num_embeddings",
            ],
            ResourceType::Generic => &[],
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Chain bookkeeping for one version of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Semver string (`1.0.0`, `1.0.1`, ...)
    pub version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Lowercase-hex SHA-256 of the canonical content
    pub data_hash: String,
    /// Whether this version is the head of its chain
    pub is_latest: bool,
    /// Record id this version replaced
    pub supersedes: Option<String>,
    /// Record id that replaced this version
    pub superseded_by: Option<String>,
    /// Record ids this version depends on (never deleted out from under it)
    pub dependencies: Vec<String>,
}

/// Where the content of a record lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentLocation {
    /// Content is small and stored on the record itself
    Inline,
    /// Content is stored in the two-tier cache
    External {
        /// Namespace the bytes were written under
        namespace: Namespace,
        /// Deterministic content key
        key: String,
        /// Compression policy that wrote the bytes
        compression: CompressionAlgorithm,
        /// Content hash used to verify the bytes on load
        checksum: String,
    },
}

/// A document in the cold store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Unique record id (UUID v4)
    pub id: String,
    /// Monotonic insertion sequence assigned by the cold store
    pub seq: u64,
    /// Logical resource identifier
    pub resource_id: String,
    /// Resource classification
    pub resource_type: ResourceType,
    /// Namespace backing this record's external content
    pub namespace: Namespace,
    /// Chain bookkeeping
    pub version_info: VersionInfo,
    /// Content when stored inline
    pub content_inline: Option<Value>,
    /// Content placement
    pub content_location: Option<ContentLocation>,
    /// Free-form plus promoted typed fields
    pub metadata: Map<String, Value>,
    /// Caller tags
    pub tags: Vec<String>,
    /// Optional record lifetime
    pub ttl: Option<Duration>,
}

impl VersionedRecord {
    /// Semver of this record.
    pub fn version(&self) -> &str {
        &self.version_info.version
    }

    /// Content hash of this record.
    pub fn data_hash(&self) -> &str {
        &self.version_info.data_hash
    }

    /// Whether this record is the head of its chain.
    pub fn is_latest(&self) -> bool {
        self.version_info.is_latest
    }

    /// Check the typed preconditions declared for this record's resource
    /// type. Returns a description of the violation, if any.
    ///
    /// A violating record must never be returned by `get_latest`: it is
    /// treated as absent and logged as corruption.
    pub fn typed_violation(&self) -> Option<String> {
        match self.resource_type {
            ResourceType::SemanticIndex => {
                let count = self
                    .metadata
                    .get("num_embeddings")
                    .and_then(Value::as_u64)
                    .or_else(|| {
                        self.content_inline
                            .as_ref()
                            .and_then(|c| c.get("num_embeddings"))
                            .and_then(Value::as_u64)
                    });
                match count {
                    Some(0) => Some("semantic index with num_embeddings = 0".to_string()),
                    None => Some("semantic index without num_embeddings".to_string()),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Options accepted by `VersionManager::save`.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Explicit version; must be strictly greater than the current latest
    pub version: Option<String>,
    /// Free-form metadata merged into the record
    pub metadata: Map<String, Value>,
    /// Caller tags
    pub tags: Vec<String>,
    /// Optional record lifetime
    pub ttl: Option<Duration>,
    /// Skip content-hash deduplication and always append a version
    pub force_new: bool,
    /// Record ids the new version depends on
    pub dependencies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_type_namespace_mapping_is_total() {
        for rt in ResourceType::ALL {
            // Every type maps somewhere and the label round-trips through serde
            let _ = rt.namespace();
            let json = serde_json::to_string(&rt).unwrap();
            let back: ResourceType = serde_json::from_str(&json).unwrap();
            assert_eq!(rt, back);
        }
    }

    #[test]
    fn test_content_location_serde_tagging() {
        let loc = ContentLocation::External {
            namespace: Namespace::Trie,
            key: "abc".into(),
            compression: CompressionAlgorithm::Zstd,
            checksum: "deadbeef".into(),
        };
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json["kind"], "external");

        let inline = serde_json::to_value(ContentLocation::Inline).unwrap();
        assert_eq!(inline["kind"], "inline");
    }

    #[test]
    fn test_semantic_typed_violation() {
        let mut metadata = Map::new();
        metadata.insert("num_embeddings".into(), json!(0));

        let record = VersionedRecord {
            id: "r1".into(),
            seq: 1,
            resource_id: "semantic:en".into(),
            resource_type: ResourceType::SemanticIndex,
            namespace: Namespace::Semantic,
            version_info: VersionInfo {
                version: "1.0.0".into(),
                created_at: Utc::now(),
                data_hash: "0".repeat(64),
                is_latest: true,
                supersedes: None,
                superseded_by: None,
                dependencies: vec![],
            },
            content_inline: None,
            content_location: None,
            metadata,
            tags: vec![],
            ttl: None,
        };

        assert!(record.typed_violation().is_some());
    }
}
