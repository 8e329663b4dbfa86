//! # Semantic Index
//!
//! Dense-vector retrieval over corpus vocabulary, keyed by
//! `(corpus, model_name)`:
//! - `embedder`: the text→vector seam plus a deterministic hashing backend
//! - `index`: flat / IVF-Flat / IVF-PQ / HNSW ANN structures with INT8
//!   vector storage
//!
//! An index is built off the query path, persisted through the version
//! manager only after embeddings exist, and refused on load when empty or
//! inconsistent. `num_embeddings = 0` is never a valid persisted state.

pub mod embedder;
pub mod index;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::corpus::CorpusEntity;
use crate::versioning::{ProgressEvent, ProgressFn};

use super::{b64_opt, Result, SearchError};

pub use embedder::{Embedder, HashEmbedder};
pub use index::{choose_index_type, AnnIndex, IndexType, Vectors};

/// Embedding batch size used during builds.
const EMBED_BATCH: usize = 256;

/// Persisted form of a semantic index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticIndexEntity {
    /// Corpus this index was built from
    pub corpus_id: String,
    /// Embedder that produced the vectors
    pub model_name: String,
    /// Vocabulary hash the index is valid for
    pub vocabulary_hash: String,
    /// Vector dimension
    pub embedding_dimension: usize,
    /// ANN variant in `binary_index`
    pub index_type: IndexType,
    /// Number of embedded rows; zero is invalid and never persisted
    pub num_embeddings: usize,
    /// bincode payload: row words + vector store
    #[serde(with = "b64_opt")]
    pub binary_embeddings: Option<Vec<u8>>,
    /// bincode payload: the ANN structure
    #[serde(with = "b64_opt")]
    pub binary_index: Option<Vec<u8>>,
}

/// Resource id a semantic index persists under.
pub fn semantic_resource_id(corpus_id: &str, model_name: &str) -> String {
    format!("semantic:{corpus_id}:{model_name}")
}

#[derive(Serialize, Deserialize)]
struct EmbeddingsBlob {
    words: Vec<String>,
    vectors: Vectors,
}

/// One scored semantic hit: a normalized word and its similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticHit {
    /// Normalized vocabulary form
    pub word: String,
    /// Cosine similarity clamped to `[0, 1]`
    pub score: f64,
}

/// In-memory semantic index.
pub struct SemanticIndex {
    corpus_id: String,
    model_name: String,
    vocabulary_hash: String,
    words: Vec<String>,
    vectors: Vectors,
    index: AnnIndex,
}

impl SemanticIndex {
    /// Embed a corpus's vocabulary and build the ANN structure.
    ///
    /// Rows are the corpus's normalized forms; the embedded text pairs each
    /// form with its lemma so inflected variants land near their stem.
    /// Returns `Cancelled` without side effects when the token fires.
    pub async fn build(
        corpus: &CorpusEntity,
        embedder: &dyn Embedder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        Self::build_with(corpus, embedder, cancel, None).await
    }

    /// Build with progress reporting. Callers who pass no callback pay
    /// nothing.
    pub async fn build_with(
        corpus: &CorpusEntity,
        embedder: &dyn Embedder,
        cancel: Option<&CancellationToken>,
        progress: Option<ProgressFn>,
    ) -> Result<Self> {
        let words = corpus.normalized_vocabulary.clone();
        if words.is_empty() {
            return Err(SearchError::Semantic(
                "corpus has no vocabulary to embed".to_string(),
            ));
        }

        let texts: Vec<String> = words
            .iter()
            .map(|norm| match corpus.lemma_for_normalized(norm) {
                Some(lemma) if lemma != norm.as_str() => format!("{norm} {lemma}"),
                _ => norm.clone(),
            })
            .collect();

        let dim = embedder.dimension();
        let total_batches = texts.len().div_ceil(EMBED_BATCH);
        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(EMBED_BATCH).enumerate() {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return Err(SearchError::Cancelled);
            }
            if let Some(report) = &progress {
                report(ProgressEvent {
                    stage: "embed",
                    fraction: batch_index as f32 / total_batches as f32,
                    message: format!("embedding batch {}/{total_batches}", batch_index + 1),
                });
            }
            let embedded = embedder.embed_batch(batch).await?;
            if embedded.len() != batch.len() {
                return Err(SearchError::Embedding(format!(
                    "embedder returned {} vectors for a batch of {}",
                    embedded.len(),
                    batch.len()
                )));
            }
            for vector in &embedded {
                if vector.len() != dim {
                    return Err(SearchError::Embedding(format!(
                        "embedder returned dimension {} (expected {dim})",
                        vector.len()
                    )));
                }
            }
            rows.extend(embedded);
        }

        if let Some(report) = &progress {
            report(ProgressEvent {
                stage: "index",
                fraction: 1.0,
                message: format!("building ANN index over {} vectors", rows.len()),
            });
        }
        let vectors = Vectors::from_rows(&rows, dim);
        let index = AnnIndex::build(&vectors, choose_index_type(vectors.len()), cancel)?;

        Ok(Self {
            corpus_id: corpus.corpus_id.clone(),
            model_name: embedder.model_name().to_string(),
            vocabulary_hash: corpus.vocabulary_hash.clone(),
            words,
            vectors,
            index,
        })
    }

    /// Top-`k` vocabulary words by similarity to a query vector.
    pub fn search(&self, query: &[f32], k: usize, min_score: f64) -> Vec<SemanticHit> {
        self.index
            .search(&self.vectors, query, k)
            .into_iter()
            .map(|(row, sim)| SemanticHit {
                word: self.words[row].clone(),
                score: (sim as f64).clamp(0.0, 1.0),
            })
            .filter(|hit| hit.score >= min_score)
            .collect()
    }

    /// Number of embedded rows.
    pub fn num_embeddings(&self) -> usize {
        self.vectors.len()
    }

    /// Vocabulary hash this index was built against.
    pub fn vocabulary_hash(&self) -> &str {
        &self.vocabulary_hash
    }

    /// Model that produced the vectors.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Snapshot into the persisted form. Refuses to serialize an empty
    /// index; that state must never reach the cold store.
    pub fn to_entity(&self) -> Result<SemanticIndexEntity> {
        if self.vectors.is_empty() {
            return Err(SearchError::Semantic(
                "refusing to persist a semantic index with zero embeddings".to_string(),
            ));
        }
        let blob = EmbeddingsBlob {
            words: self.words.clone(),
            vectors: self.vectors.clone(),
        };
        Ok(SemanticIndexEntity {
            corpus_id: self.corpus_id.clone(),
            model_name: self.model_name.clone(),
            vocabulary_hash: self.vocabulary_hash.clone(),
            embedding_dimension: self.vectors.dim(),
            index_type: self.index.index_type(),
            num_embeddings: self.vectors.len(),
            binary_embeddings: Some(bincode::serialize(&blob)?),
            binary_index: Some(bincode::serialize(&self.index)?),
        })
    }

    /// Rehydrate from the persisted form. Empty or internally inconsistent
    /// entities are refused.
    pub fn from_entity(entity: &SemanticIndexEntity) -> Result<Self> {
        if entity.num_embeddings == 0 {
            return Err(SearchError::Semantic(
                "semantic index entity has zero embeddings".to_string(),
            ));
        }
        let embeddings_bytes = entity.binary_embeddings.as_deref().ok_or_else(|| {
            SearchError::Semantic("semantic index entity missing embeddings payload".to_string())
        })?;
        let index_bytes = entity.binary_index.as_deref().ok_or_else(|| {
            SearchError::Semantic("semantic index entity missing index payload".to_string())
        })?;

        let blob: EmbeddingsBlob = bincode::deserialize(embeddings_bytes)?;
        let index: AnnIndex = bincode::deserialize(index_bytes)?;

        if blob.vectors.len() != entity.num_embeddings
            || blob.words.len() != entity.num_embeddings
            || blob.vectors.dim() != entity.embedding_dimension
        {
            return Err(SearchError::Semantic(format!(
                "semantic index entity is inconsistent: {} words, {} vectors, dim {} (declared {} rows, dim {})",
                blob.words.len(),
                blob.vectors.len(),
                blob.vectors.dim(),
                entity.num_embeddings,
                entity.embedding_dimension
            )));
        }

        Ok(Self {
            corpus_id: entity.corpus_id.clone(),
            model_name: entity.model_name.clone(),
            vocabulary_hash: entity.vocabulary_hash.clone(),
            words: blob.words,
            vectors: blob.vectors,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{CorpusEntity, CorpusType};

    fn corpus() -> CorpusEntity {
        let mut corpus = CorpusEntity::new("c1", "test", CorpusType::Dictionary, "en");
        corpus.add_words(["hello", "help", "helping", "xenon", "zebra"]);
        corpus
    }

    #[tokio::test]
    async fn test_build_and_self_search() {
        let corpus = corpus();
        let embedder = HashEmbedder::new(64);
        let index = SemanticIndex::build(&corpus, &embedder, None).await.unwrap();

        assert_eq!(index.num_embeddings(), corpus.normalized_len());

        let query = embedder
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap()
            .remove(0);
        let hits = index.search(&query, 3, 0.0);
        assert_eq!(hits[0].word, "hello");
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_entity_round_trip() {
        let corpus = corpus();
        let embedder = HashEmbedder::new(64);
        let index = SemanticIndex::build(&corpus, &embedder, None).await.unwrap();

        let entity = index.to_entity().unwrap();
        assert_eq!(entity.num_embeddings, index.num_embeddings());
        assert_eq!(entity.model_name, "hash-ngram-64");

        // Through JSON, as the version manager stores it
        let json = serde_json::to_value(&entity).unwrap();
        let back: SemanticIndexEntity = serde_json::from_value(json).unwrap();
        let restored = SemanticIndex::from_entity(&back).unwrap();

        let query = embedder
            .embed_batch(&["help".to_string()])
            .await
            .unwrap()
            .remove(0);
        let a = index.search(&query, 3, 0.0);
        let b = restored.search(&query, 3, 0.0);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_empty_entity_is_refused() {
        let corpus = corpus();
        let embedder = HashEmbedder::new(64);
        let index = SemanticIndex::build(&corpus, &embedder, None).await.unwrap();

        let mut entity = index.to_entity().unwrap();
        entity.num_embeddings = 0;
        assert!(SemanticIndex::from_entity(&entity).is_err());

        let mut entity = index.to_entity().unwrap();
        entity.binary_index = None;
        assert!(SemanticIndex::from_entity(&entity).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_build_has_no_result() {
        let corpus = corpus();
        let embedder = HashEmbedder::new(64);
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            SemanticIndex::build(&corpus, &embedder, Some(&token)).await,
            Err(SearchError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_empty_corpus_cannot_build() {
        let corpus = CorpusEntity::new("c2", "empty", CorpusType::Dictionary, "en");
        let embedder = HashEmbedder::new(64);
        assert!(SemanticIndex::build(&corpus, &embedder, None).await.is_err());
    }
}
