//! # Corpus Management
//!
//! Corpora are the source of truth for the search stack. This module owns:
//! - vocabulary storage with normalization, lemmatization, and signature
//!   buckets (`entity`, `normalize`)
//! - the parent/child corpus tree with union aggregation
//! - cascade-aware deletion (indexes and children go with the corpus)
//!
//! Corpora persist through the version manager as ordinary versioned
//! records; derived search indexes hold only `corpus_id` +
//! `vocabulary_hash`, never object references, so the dependency graph
//! stays a strict DAG (index → corpus lookups only).

pub mod entity;
pub mod normalize;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map};

use crate::versioning::{
    ResourceType, SaveOptions, VersionError, VersionManager, VersionedRecord,
};

pub use entity::{CorpusEntity, CorpusType};
pub use normalize::{lemmatize, normalize_word, signature_key};

/// Corpus error types
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    /// Corpus names are unique; this one is already in use
    #[error("Corpus name already taken: {0}")]
    NameTaken(String),

    /// No corpus with the given id
    #[error("Corpus not found: {0}")]
    NotFound(String),

    /// Attaching this child would create a cycle in the corpus tree
    #[error("Corpus cycle: {child} is already an ancestor of {parent}")]
    Cycle {
        /// Would-be parent corpus id
        parent: String,
        /// Would-be child corpus id
        child: String,
    },

    /// Versioning layer failure
    #[error("Versioning error: {0}")]
    Version(#[from] VersionError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for corpus operations
pub type Result<T> = std::result::Result<T, CorpusError>;

/// Corpus manager configuration
#[derive(Debug, Clone)]
pub struct CorpusConfig {
    /// Language assigned to corpora created without an explicit one
    pub default_language: String,
    /// Re-aggregate ancestor corpora when a descendant's vocabulary changes
    pub propagate_aggregation: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            propagate_aggregation: true,
        }
    }
}

/// Resource id of a corpus in the cold store.
pub fn corpus_resource_id(corpus_id: &str) -> String {
    format!("corpus:{corpus_id}")
}

/// Vocabulary store and corpus tree manager.
pub struct CorpusManager {
    vcm: Arc<VersionManager>,
    config: CorpusConfig,
}

impl CorpusManager {
    /// Create a corpus manager over the shared version manager.
    pub fn new(vcm: Arc<VersionManager>, config: CorpusConfig) -> Self {
        Self { vcm, config }
    }

    /// Create and persist a new corpus. Names are unique.
    pub async fn create(
        &self,
        name: &str,
        corpus_type: CorpusType,
        language: Option<&str>,
    ) -> Result<CorpusEntity> {
        if self.get_by_name(name).await?.is_some() {
            return Err(CorpusError::NameTaken(name.to_string()));
        }

        let corpus = CorpusEntity::new(
            uuid::Uuid::new_v4().to_string(),
            name,
            corpus_type,
            language.unwrap_or(&self.config.default_language),
        );
        self.save(&corpus).await?;
        tracing::debug!(corpus_id = %corpus.corpus_id, name, "created corpus");
        Ok(corpus)
    }

    /// Load the latest snapshot of a corpus.
    pub async fn get(&self, corpus_id: &str) -> Result<Option<CorpusEntity>> {
        let resource_id = corpus_resource_id(corpus_id);
        let Some(record) = self
            .vcm
            .get_latest(ResourceType::Corpus, &resource_id)
            .await?
        else {
            return Ok(None);
        };
        let content = self.vcm.load_content(&record).await?;
        Ok(Some(serde_json::from_value(content)?))
    }

    /// Load a corpus by its unique name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<CorpusEntity>> {
        let records = self
            .vcm
            .cold_store()
            .find_by_metadata("corpus_name", name)?;
        let Some(record) = records.into_iter().find(VersionedRecord::is_latest) else {
            return Ok(None);
        };
        let content = self.vcm.load_content(&record).await?;
        Ok(Some(serde_json::from_value(content)?))
    }

    /// Persist a corpus snapshot through the version manager.
    pub async fn save(&self, corpus: &CorpusEntity) -> Result<VersionedRecord> {
        let content = serde_json::to_value(corpus)?;
        let mut metadata = Map::new();
        if let Some(parent) = &corpus.parent_id {
            metadata.insert("parent_corpus_id".to_string(), json!(parent));
        }

        let record = self
            .vcm
            .save(
                ResourceType::Corpus,
                &corpus_resource_id(&corpus.corpus_id),
                content,
                SaveOptions {
                    metadata,
                    ..SaveOptions::default()
                },
            )
            .await?;
        Ok(record)
    }

    /// Add words to a corpus and persist the new snapshot. Ancestor masters
    /// are re-aggregated.
    pub async fn add_words<S: AsRef<str>>(
        &self,
        corpus_id: &str,
        words: &[S],
    ) -> Result<CorpusEntity> {
        let mut corpus = self
            .get(corpus_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(corpus_id.to_string()))?;

        corpus.add_words(words.iter().map(|w| w.as_ref()));
        self.save(&corpus).await?;
        self.propagate_upward(&corpus).await?;
        Ok(corpus)
    }

    /// Remove words from a corpus and persist the new snapshot.
    pub async fn remove_words<S: AsRef<str>>(
        &self,
        corpus_id: &str,
        words: &[S],
    ) -> Result<CorpusEntity> {
        let mut corpus = self
            .get(corpus_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(corpus_id.to_string()))?;

        corpus.remove_words(words.iter().map(|w| w.as_ref()));
        self.save(&corpus).await?;
        self.propagate_upward(&corpus).await?;
        Ok(corpus)
    }

    /// Attach a child corpus to a parent and re-aggregate the parent.
    pub async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<CorpusEntity> {
        if parent_id == child_id {
            return Err(CorpusError::Cycle {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
            });
        }
        // Walking the child's subtree finds the parent exactly when the edge
        // would close a loop.
        if self.subtree_ids(child_id).await?.contains(parent_id) {
            return Err(CorpusError::Cycle {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
            });
        }

        let mut child = self
            .get(child_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(child_id.to_string()))?;
        let parent = self
            .get(parent_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(parent_id.to_string()))?;

        child.parent_id = Some(parent.corpus_id.clone());
        self.save(&child).await?;

        // Aggregate against a fresh parent snapshot so a concurrent save
        // cannot resurrect a stale vocabulary.
        let mut parent = self
            .get(parent_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(parent_id.to_string()))?;
        if !parent.child_ids.contains(&child.corpus_id) {
            parent.child_ids.push(child.corpus_id.clone());
        }
        self.aggregate_into(&mut parent).await?;
        self.save(&parent).await?;
        self.propagate_upward(&parent).await?;
        Ok(parent)
    }

    /// Detach a child corpus and re-aggregate the parent.
    pub async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<CorpusEntity> {
        if let Some(mut child) = self.get(child_id).await? {
            if child.parent_id.as_deref() == Some(parent_id) {
                child.parent_id = None;
                self.save(&child).await?;
            }
        }

        let mut parent = self
            .get(parent_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(parent_id.to_string()))?;
        parent.child_ids.retain(|id| id != child_id);
        self.aggregate_into(&mut parent).await?;
        self.save(&parent).await?;
        self.propagate_upward(&parent).await?;
        Ok(parent)
    }

    /// Recompute a master's effective vocabulary from its own words and its
    /// children, then persist it.
    pub async fn aggregate(&self, corpus_id: &str) -> Result<CorpusEntity> {
        let mut corpus = self
            .get(corpus_id)
            .await?
            .ok_or_else(|| CorpusError::NotFound(corpus_id.to_string()))?;
        self.aggregate_into(&mut corpus).await?;
        self.save(&corpus).await?;
        Ok(corpus)
    }

    /// Delete a corpus. With `cascade`, every derived search index and every
    /// descendant corpus goes with it, and the parent's `child_ids` is
    /// updated. Returns the number of cold-store records removed.
    pub async fn delete(&self, corpus_id: &str, cascade: bool) -> Result<u64> {
        let Some(corpus) = self.get(corpus_id).await? else {
            return Ok(0);
        };

        let mut deleted = 0u64;

        // Detach from the parent first so its aggregation stops seeing us.
        if let Some(parent_id) = &corpus.parent_id {
            if let Some(mut parent) = self.get(parent_id).await? {
                parent.child_ids.retain(|id| id != corpus_id);
                self.aggregate_into(&mut parent).await?;
                self.save(&parent).await?;
            }
        }

        let mut queue = vec![corpus];
        while let Some(current) = queue.pop() {
            if cascade {
                for child_id in &current.child_ids {
                    if let Some(child) = self.get(child_id).await? {
                        queue.push(child);
                    }
                }
                deleted += self.delete_indexes_for(&current.corpus_id).await?;
            }
            deleted += self
                .vcm
                .delete(
                    ResourceType::Corpus,
                    &corpus_resource_id(&current.corpus_id),
                    false,
                )
                .await?;
        }

        tracing::debug!(corpus_id, deleted, cascade, "deleted corpus");
        Ok(deleted)
    }

    /// Delete every search/trie/semantic index referencing a corpus.
    async fn delete_indexes_for(&self, corpus_id: &str) -> Result<u64> {
        let mut deleted = 0u64;
        let records = self
            .vcm
            .cold_store()
            .find_by_metadata("corpus_id", corpus_id)?;

        let mut resources: HashSet<(ResourceType, String)> = HashSet::new();
        for record in records {
            match record.resource_type {
                ResourceType::SearchIndex
                | ResourceType::TrieIndex
                | ResourceType::SemanticIndex => {
                    resources.insert((record.resource_type, record.resource_id));
                }
                _ => {}
            }
        }
        for (resource_type, resource_id) in resources {
            deleted += self.vcm.delete(resource_type, &resource_id, false).await?;
        }
        Ok(deleted)
    }

    async fn aggregate_into(&self, corpus: &mut CorpusEntity) -> Result<()> {
        let mut words = corpus.own_vocabulary.clone();
        for child_id in corpus.child_ids.clone() {
            if let Some(child) = self.get(&child_id).await? {
                words.extend(child.vocabulary);
            }
        }
        corpus.set_aggregated_vocabulary(words);
        Ok(())
    }

    /// Re-aggregate the ancestor chain after a vocabulary change.
    async fn propagate_upward(&self, corpus: &CorpusEntity) -> Result<()> {
        if !self.config.propagate_aggregation {
            return Ok(());
        }
        let mut next = corpus.parent_id.clone();
        let mut visited = HashSet::new();
        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) {
                break;
            }
            let Some(mut parent) = self.get(&parent_id).await? else {
                break;
            };
            self.aggregate_into(&mut parent).await?;
            self.save(&parent).await?;
            next = parent.parent_id;
        }
        Ok(())
    }

    /// Ids of a corpus and every descendant.
    async fn subtree_ids(&self, corpus_id: &str) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        let mut queue = vec![corpus_id.to_string()];
        while let Some(id) = queue.pop() {
            if !ids.insert(id.clone()) {
                continue;
            }
            if let Some(corpus) = self.get(&id).await? {
                queue.extend(corpus.child_ids);
            }
        }
        Ok(ids)
    }

    /// The version manager backing this corpus manager.
    pub fn version_manager(&self) -> &Arc<VersionManager> {
        &self.vcm
    }
}
