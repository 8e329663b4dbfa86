//! Content store
//!
//! Decides where record content lives. Small content (canonical size below
//! the inline threshold) stays on the record itself; everything else goes to
//! the two-tier cache under a deterministic content key derived from the
//! resource id and the content hash, pinned so cache TTLs cannot reap it.
//!
//! Loads verify the checksum recorded at store time: a mismatch means the
//! warm tier handed back bytes that are not the content the record points
//! at, and that is corruption, not a miss.

use std::sync::Arc;

use serde_json::Value;

use crate::cache::{CacheManager, Namespace};
use crate::core::{canonical_json_bytes, content_hash, resource_content_key};

use super::record::{ContentLocation, ResourceType, VersionedRecord};
use super::{Result, VersionError};

/// Inline-vs-external content placement.
pub struct ContentStore {
    cache: Arc<CacheManager>,
    inline_threshold: usize,
}

/// Outcome of a `store` call: where the content went, and the inline copy
/// when it stayed on the record.
pub struct StoredContent {
    /// Placement recorded on the owning `VersionedRecord`
    pub location: ContentLocation,
    /// Canonicalized content to embed inline, when placement is `Inline`
    pub inline: Option<Value>,
}

impl ContentStore {
    /// Create a content store over the shared two-tier cache.
    pub fn new(cache: Arc<CacheManager>, inline_threshold: usize) -> Self {
        Self {
            cache,
            inline_threshold,
        }
    }

    /// Place content for a record being saved.
    ///
    /// The canonical serialization happens exactly once; `data_hash` is the
    /// hash of those same bytes, computed by the caller.
    pub async fn store(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        content: &Value,
        data_hash: &str,
    ) -> Result<StoredContent> {
        let bytes = canonical_json_bytes(content)?;

        if bytes.len() < self.inline_threshold {
            return Ok(StoredContent {
                location: ContentLocation::Inline,
                inline: Some(content.clone()),
            });
        }

        let namespace = resource_type.namespace();
        let key = resource_content_key(resource_id, data_hash);
        let compression = self.cache.config().namespace(namespace).compression;

        self.cache.set_pinned(namespace, &key, content).await?;

        Ok(StoredContent {
            location: ContentLocation::External {
                namespace,
                key,
                compression,
                checksum: data_hash.to_string(),
            },
            inline: None,
        })
    }

    /// Load the content a record points at.
    pub async fn load(&self, record: &VersionedRecord) -> Result<Value> {
        match &record.content_location {
            Some(ContentLocation::Inline) | None => record
                .content_inline
                .clone()
                .ok_or_else(|| {
                    VersionError::Corruption(format!(
                        "record {} declares inline content but carries none",
                        record.id
                    ))
                }),
            Some(ContentLocation::External {
                namespace,
                key,
                checksum,
                ..
            }) => {
                let value = self
                    .cache
                    .get(*namespace, key)
                    .await
                    .ok_or_else(|| VersionError::ContentMissing { key: key.clone() })?;

                let actual = content_hash(&value)?;
                if &actual != checksum {
                    return Err(VersionError::ContentCorrupt {
                        expected: checksum.clone(),
                        actual,
                    });
                }
                Ok(value.as_ref().clone())
            }
        }
    }

    /// Remove the external bytes backing a record, if any.
    pub async fn discard(&self, record: &VersionedRecord) -> Result<()> {
        if let Some(ContentLocation::External { namespace, key, .. }) = &record.content_location {
            self.cache.delete(*namespace, key).await?;
        }
        Ok(())
    }

    /// The namespace external content would use for a resource type.
    pub fn namespace_for(&self, resource_type: ResourceType) -> Namespace {
        resource_type.namespace()
    }
}
