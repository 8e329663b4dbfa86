//! Version manager
//!
//! The write path for every versioned resource. `save` owns the full
//! pipeline: canonical hash, per-resource lock, content-hash dedup, semver
//! assignment, content placement, and the atomic chain flip in the cold
//! store. Hashing and serialization happen before the lock is taken; only
//! the dedup check, version assignment, content write, and chain commit run
//! inside it, so disjoint resources never contend.

use std::collections::HashSet;
use std::sync::Arc;

use semver::Version;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::core::canonical::{canonical_json_bytes, canonicalize};
use crate::core::hash::sha256_hex;

use super::coldstore::ColdStore;
use super::content::ContentStore;
use super::locks::ResourceLockTable;
use super::record::{ResourceType, SaveOptions, VersionInfo, VersionedRecord};
use super::{ProgressEvent, ProgressFn, Result, VersionConfig, VersionError};

/// Versioned content-addressable record manager.
pub struct VersionManager {
    cold: Arc<ColdStore>,
    content: ContentStore,
    locks: ResourceLockTable,
    config: VersionConfig,
}

impl VersionManager {
    /// Create a version manager over a cold store and the shared cache.
    pub fn new(cold: Arc<ColdStore>, cache: Arc<CacheManager>, config: VersionConfig) -> Self {
        let content = ContentStore::new(cache, config.inline_threshold);
        Self {
            cold,
            content,
            locks: ResourceLockTable::new(),
            config,
        }
    }

    /// Save content as a new version of a resource.
    ///
    /// Idempotent on content: unless `opts.force_new`, saving content whose
    /// hash already exists on this resource returns the existing record
    /// without appending a version.
    pub async fn save(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        content: Value,
        opts: SaveOptions,
    ) -> Result<VersionedRecord> {
        validate_resource_id(resource_id)?;
        if !content.is_object() {
            return Err(VersionError::InvalidInput(
                "content must be a JSON object".to_string(),
            ));
        }

        // Heavy work first, outside the per-resource lock.
        let canonical = canonicalize(&content);
        let data_hash = sha256_hex(&canonical_json_bytes(&canonical)?);

        let requested_version = match &opts.version {
            Some(v) => Some(Version::parse(v).map_err(|e| {
                VersionError::InvalidInput(format!("invalid semver {v:?}: {e}"))
            })?),
            None => None,
        };

        // Write-side typed preconditions, checked before any mutation.
        if let Some(violation) = typed_write_violation(resource_type, &canonical) {
            return Err(VersionError::InvalidInput(violation));
        }

        let _guard = self
            .locks
            .acquire(resource_type, resource_id, self.config.lock_timeout)
            .await?;

        if !opts.force_new {
            if let Some(existing) = self.cold.get_by_hash(resource_type, resource_id, &data_hash)? {
                tracing::debug!(
                    resource = %resource_id,
                    hash = %data_hash,
                    record = %existing.id,
                    "save deduplicated against existing version"
                );
                return Ok(existing);
            }
        }

        let latest = self.cold.get_latest(resource_type, resource_id)?;
        let version = next_version(latest.as_ref(), requested_version)?;

        let stored = self
            .content
            .store(resource_type, resource_id, &canonical, &data_hash)
            .await?;

        let mut metadata = opts.metadata;
        for field in resource_type.typed_fields() {
            if let Some(value) = canonical.get(*field) {
                metadata.insert((*field).to_string(), value.clone());
            }
        }

        let record = VersionedRecord {
            id: Uuid::new_v4().to_string(),
            seq: self.cold.next_seq()?,
            resource_id: resource_id.to_string(),
            resource_type,
            namespace: resource_type.namespace(),
            version_info: VersionInfo {
                version: version.to_string(),
                created_at: chrono::Utc::now(),
                data_hash,
                is_latest: true,
                supersedes: latest.as_ref().map(|r| r.id.clone()),
                superseded_by: None,
                dependencies: opts.dependencies,
            },
            content_inline: stored.inline,
            content_location: Some(stored.location),
            metadata,
            tags: opts.tags,
            ttl: opts.ttl,
        };

        let prior = latest.map(|mut p| {
            p.version_info.is_latest = false;
            p.version_info.superseded_by = Some(record.id.clone());
            p
        });

        self.cold.commit_new_version(&record, prior.as_ref())?;
        tracing::debug!(
            resource = %resource_id,
            version = %record.version(),
            record = %record.id,
            "saved new version"
        );
        Ok(record)
    }

    /// Latest version of a resource.
    ///
    /// A head whose typed preconditions are violated is corruption: it is
    /// logged and reported as absent, never returned.
    pub async fn get_latest(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Option<VersionedRecord>> {
        let Some(record) = self.cold.get_latest(resource_type, resource_id)? else {
            return Ok(None);
        };
        if let Some(violation) = record.typed_violation() {
            tracing::error!(
                resource = %resource_id,
                record = %record.id,
                violation,
                "latest record fails typed preconditions, treating as absent"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// A specific version of a resource.
    pub async fn get_by_version(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        version: &str,
    ) -> Result<Option<VersionedRecord>> {
        self.cold.get_by_version(resource_type, resource_id, version)
    }

    /// The version of a resource carrying a given content hash.
    pub async fn get_by_hash(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        data_hash: &str,
    ) -> Result<Option<VersionedRecord>> {
        self.cold.get_by_hash(resource_type, resource_id, data_hash)
    }

    /// Every surviving version of a resource, newest first.
    pub async fn list_versions(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Vec<VersionedRecord>> {
        self.cold.list_versions(resource_type, resource_id)
    }

    /// Load the content a record points at.
    pub async fn load_content(&self, record: &VersionedRecord) -> Result<Value> {
        self.content.load(record).await
    }

    /// Delete a resource: every version plus its external content.
    ///
    /// With `cascade`, resources whose records declare a dependency on any
    /// deleted record are deleted transitively as well. Returns the number
    /// of records removed.
    pub async fn delete(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        cascade: bool,
    ) -> Result<u64> {
        let mut deleted = 0u64;
        let mut queue = vec![(resource_type, resource_id.to_string())];
        let mut seen: HashSet<(ResourceType, String)> = HashSet::new();

        while let Some((rt, rid)) = queue.pop() {
            if !seen.insert((rt, rid.clone())) {
                continue;
            }
            let _guard = self.locks.acquire(rt, &rid, self.config.lock_timeout).await?;

            for record in self.cold.list_versions(rt, &rid)? {
                if cascade {
                    for dependent in self.cold.find_by_metadata("__dep", &record.id)? {
                        queue.push((dependent.resource_type, dependent.resource_id));
                    }
                }
                self.content.discard(&record).await?;
                self.cold.delete_record(&record)?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::debug!(resource = %resource_id, deleted, cascade, "deleted resource");
        }
        Ok(deleted)
    }

    /// Retention sweep keeping the configured number of newest versions.
    pub async fn retain_default(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<u64> {
        let keep = self.config.retention_for(resource_type);
        self.retain(resource_type, resource_id, keep).await
    }

    /// Retention sweep keeping the `keep` newest versions.
    pub async fn retain(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        keep: usize,
    ) -> Result<u64> {
        self.retain_with(resource_type, resource_id, keep, None, None)
            .await
    }

    /// Retention sweep with optional cancellation and progress reporting.
    ///
    /// Never deletes the chain head, and never deletes a version that some
    /// surviving record declares as a dependency. Cancelling mid-sweep stops
    /// cleanly: versions already removed stay removed, nothing is left
    /// half-deleted.
    pub async fn retain_with(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        keep: usize,
        cancel: Option<&CancellationToken>,
        progress: Option<ProgressFn>,
    ) -> Result<u64> {
        let _guard = self
            .locks
            .acquire(resource_type, resource_id, self.config.lock_timeout)
            .await?;

        let versions = self.cold.list_versions(resource_type, resource_id)?;
        if versions.len() <= keep {
            return Ok(0);
        }

        let candidates = &versions[keep..];
        let total = candidates.len();
        let mut deleted = 0u64;

        for (i, record) in candidates.iter().enumerate() {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                tracing::debug!(resource = %resource_id, deleted, "retention sweep cancelled");
                break;
            }
            if record.is_latest() {
                continue;
            }
            if !self.cold.find_by_metadata("__dep", &record.id)?.is_empty() {
                tracing::debug!(
                    record = %record.id,
                    "retention kept version still referenced as a dependency"
                );
                continue;
            }

            self.content.discard(record).await?;
            self.cold.delete_record(record)?;
            deleted += 1;

            if let Some(report) = &progress {
                report(ProgressEvent {
                    stage: "retention",
                    fraction: (i + 1) as f32 / total as f32,
                    message: format!("removed version {}", record.version()),
                });
            }
        }

        Ok(deleted)
    }

    /// The cold store backing this manager.
    pub fn cold_store(&self) -> &Arc<ColdStore> {
        &self.cold
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &VersionConfig {
        &self.config
    }
}

fn validate_resource_id(resource_id: &str) -> Result<()> {
    if resource_id.is_empty() {
        return Err(VersionError::InvalidInput(
            "resource_id must not be empty".to_string(),
        ));
    }
    if resource_id.contains('\0') {
        return Err(VersionError::InvalidInput(
            "resource_id must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

/// Write-side typed preconditions per resource type.
fn typed_write_violation(resource_type: ResourceType, content: &Value) -> Option<String> {
    match resource_type {
        ResourceType::SemanticIndex => match content.get("num_embeddings").and_then(Value::as_u64) {
            Some(n) if n > 0 => None,
            Some(_) => Some("semantic index must not be persisted with num_embeddings = 0".into()),
            None => Some("semantic index content requires num_embeddings".into()),
        },
        _ => None,
    }
}

fn next_version(
    latest: Option<&VersionedRecord>,
    requested: Option<Version>,
) -> Result<Version> {
    let current = match latest {
        Some(record) => Some(Version::parse(record.version()).map_err(|e| {
            VersionError::Corruption(format!(
                "record {} carries unparseable version {:?}: {e}",
                record.id,
                record.version()
            ))
        })?),
        None => None,
    };

    match (requested, current) {
        (Some(requested), Some(current)) => {
            if requested > current {
                Ok(requested)
            } else {
                Err(VersionError::VersionConflict {
                    requested: requested.to_string(),
                    current: current.to_string(),
                })
            }
        }
        (Some(requested), None) => Ok(requested),
        (None, Some(mut current)) => {
            current.patch += 1;
            Ok(current)
        }
        (None, None) => Ok(Version::new(1, 0, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, VersionManager) {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::open(CacheConfig {
            directory: dir.path().join("cache"),
            ..CacheConfig::default()
        })
        .unwrap();
        let cold = Arc::new(ColdStore::open(&dir.path().join("cold"), true).unwrap());
        (dir, VersionManager::new(cold, cache, VersionConfig::default()))
    }

    #[tokio::test]
    async fn test_first_save_is_1_0_0() {
        let (_dir, vcm) = manager();
        let record = vcm
            .save(
                ResourceType::Generic,
                "res",
                json!({"a": 1}),
                SaveOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(record.version(), "1.0.0");
        assert!(record.is_latest());
        assert!(record.version_info.supersedes.is_none());
    }

    #[tokio::test]
    async fn test_version_bump_flips_chain() {
        let (_dir, vcm) = manager();
        let r1 = vcm
            .save(ResourceType::Generic, "res", json!({"a": 1}), SaveOptions::default())
            .await
            .unwrap();
        let r2 = vcm
            .save(ResourceType::Generic, "res", json!({"a": 2}), SaveOptions::default())
            .await
            .unwrap();

        assert_eq!(r2.version(), "1.0.1");
        assert_eq!(r2.version_info.supersedes.as_deref(), Some(r1.id.as_str()));

        let versions = vcm.list_versions(ResourceType::Generic, "res").await.unwrap();
        assert_eq!(versions.len(), 2);

        let old = versions.iter().find(|r| r.id == r1.id).unwrap();
        assert!(!old.is_latest());
        assert_eq!(old.version_info.superseded_by.as_deref(), Some(r2.id.as_str()));

        // Exactly one chain head survives the flip
        assert_eq!(versions.iter().filter(|r| r.is_latest()).count(), 1);
    }

    #[tokio::test]
    async fn test_save_is_idempotent_on_content() {
        let (_dir, vcm) = manager();
        let r1 = vcm
            .save(
                ResourceType::Generic,
                "res",
                json!({"vocab": ["a", "b"], "n": 2}),
                SaveOptions::default(),
            )
            .await
            .unwrap();
        // Same logical content, different key order
        let r2 = vcm
            .save(
                ResourceType::Generic,
                "res",
                json!({"n": 2, "vocab": ["a", "b"]}),
                SaveOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(r1.id, r2.id);
        assert_eq!(
            vcm.list_versions(ResourceType::Generic, "res").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_force_new_appends_duplicate_content() {
        let (_dir, vcm) = manager();
        let opts = SaveOptions::default();
        let r1 = vcm
            .save(ResourceType::Generic, "res", json!({"a": 1}), opts.clone())
            .await
            .unwrap();
        let r2 = vcm
            .save(
                ResourceType::Generic,
                "res",
                json!({"a": 1}),
                SaveOptions {
                    force_new: true,
                    ..SaveOptions::default()
                },
            )
            .await
            .unwrap();

        assert_ne!(r1.id, r2.id);
        assert_eq!(r2.version(), "1.0.1");
    }

    #[tokio::test]
    async fn test_explicit_version_must_advance() {
        let (_dir, vcm) = manager();
        vcm.save(
            ResourceType::Generic,
            "res",
            json!({"a": 1}),
            SaveOptions {
                version: Some("2.0.0".into()),
                ..SaveOptions::default()
            },
        )
        .await
        .unwrap();

        let err = vcm
            .save(
                ResourceType::Generic,
                "res",
                json!({"a": 2}),
                SaveOptions {
                    version: Some("1.9.0".into()),
                    ..SaveOptions::default()
                },
            )
            .await;
        assert!(matches!(err, Err(VersionError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn test_content_round_trip() {
        let (_dir, vcm) = manager();
        let content = json!({"vocab": ["hello", "help"], "language": "en"});
        let record = vcm
            .save(ResourceType::Generic, "res", content.clone(), SaveOptions::default())
            .await
            .unwrap();

        let loaded = vcm.load_content(&record).await.unwrap();
        assert_eq!(loaded, canonicalize(&content));
    }

    #[tokio::test]
    async fn test_empty_semantic_index_is_rejected() {
        let (_dir, vcm) = manager();
        let err = vcm
            .save(
                ResourceType::SemanticIndex,
                "semantic:en",
                json!({"corpus_id": "en", "num_embeddings": 0}),
                SaveOptions::default(),
            )
            .await;
        assert!(matches!(err, Err(VersionError::InvalidInput(_))));
        assert!(vcm
            .get_latest(ResourceType::SemanticIndex, "semantic:en")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest_and_latest() {
        let (_dir, vcm) = manager();
        for i in 0..6 {
            vcm.save(
                ResourceType::Generic,
                "res",
                json!({"i": i}),
                SaveOptions::default(),
            )
            .await
            .unwrap();
        }

        let deleted = vcm.retain(ResourceType::Generic, "res", 3).await.unwrap();
        assert_eq!(deleted, 3);

        let versions = vcm.list_versions(ResourceType::Generic, "res").await.unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions[0].is_latest());
        assert_eq!(versions[0].version(), "1.0.5");
    }

    #[tokio::test]
    async fn test_retention_spares_dependencies() {
        let (_dir, vcm) = manager();
        let dep = vcm
            .save(ResourceType::Generic, "res", json!({"i": 0}), SaveOptions::default())
            .await
            .unwrap();
        for i in 1..5 {
            vcm.save(
                ResourceType::Generic,
                "res",
                json!({"i": i}),
                SaveOptions::default(),
            )
            .await
            .unwrap();
        }
        // Another resource depends on the oldest version
        vcm.save(
            ResourceType::Generic,
            "other",
            json!({"uses": "res"}),
            SaveOptions {
                dependencies: vec![dep.id.clone()],
                ..SaveOptions::default()
            },
        )
        .await
        .unwrap();

        vcm.retain(ResourceType::Generic, "res", 1).await.unwrap();
        let surviving: Vec<String> = vcm
            .list_versions(ResourceType::Generic, "res")
            .await
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert!(surviving.contains(&dep.id));
    }

    #[tokio::test]
    async fn test_cascade_delete_follows_dependents() {
        let (_dir, vcm) = manager();
        let base = vcm
            .save(ResourceType::Corpus, "corpus:en", json!({"corpus_id": "en"}), SaveOptions::default())
            .await
            .unwrap();
        vcm.save(
            ResourceType::TrieIndex,
            "trie:en",
            json!({"corpus_id": "en"}),
            SaveOptions {
                dependencies: vec![base.id.clone()],
                ..SaveOptions::default()
            },
        )
        .await
        .unwrap();

        let deleted = vcm.delete(ResourceType::Corpus, "corpus:en", true).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(vcm
            .get_latest(ResourceType::TrieIndex, "trie:en")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_mutation() {
        let (_dir, vcm) = manager();
        assert!(matches!(
            vcm.save(ResourceType::Generic, "", json!({}), SaveOptions::default())
                .await,
            Err(VersionError::InvalidInput(_))
        ));
        assert!(matches!(
            vcm.save(
                ResourceType::Generic,
                "res",
                json!(["not", "an", "object"]),
                SaveOptions::default()
            )
            .await,
            Err(VersionError::InvalidInput(_))
        ));
        assert_eq!(vcm.cold_store().record_count(), 0);
    }
}
