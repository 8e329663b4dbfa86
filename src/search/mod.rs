//! # Multi-Method Search
//!
//! Per-corpus search stack:
//! - `trie`: exact and prefix membership over an fst set, bloom-gated
//! - `fuzzy`: edit-distance ranking with a cheap candidate prefilter
//! - `semantic`: dense-vector ANN retrieval, built off the query path
//! - `orchestrator`: the cascading query policy over the three methods
//! - `service`: the per-corpus orchestrator registry with hot reload
//!
//! Queries cascade exact → fuzzy(+prefix) → semantic, merge, dedup by
//! canonical word, and rank by weighted score.

pub mod fuzzy;
pub mod orchestrator;
pub mod semantic;
pub mod service;
pub mod trie;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::corpus::CorpusError;
use crate::versioning::VersionError;

pub use fuzzy::{FuzzyConfig, FuzzyMatcher};
pub use orchestrator::SearchOrchestrator;
pub use semantic::{Embedder, HashEmbedder, SemanticIndex, SemanticIndexEntity};
pub use service::{RebuildOptions, SearchConfig, SearchService, SemanticStatus};
pub use trie::{TrieIndex, TrieIndexEntity};

/// Search error types
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// No corpus behind the given reference
    #[error("Corpus not found: {0}")]
    CorpusNotFound(String),

    /// Trie construction or deserialization failure
    #[error("Trie index error: {0}")]
    Trie(String),

    /// Semantic index construction or deserialization failure
    #[error("Semantic index error: {0}")]
    Semantic(String),

    /// Embedding backend failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Operation cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// Versioning layer failure
    #[error("Versioning error: {0}")]
    Version(#[from] VersionError),

    /// Corpus layer failure
    #[error("Corpus error: {0}")]
    Corpus(#[from] CorpusError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary payload encoding error
    #[error("Binary payload error: {0}")]
    Binary(#[from] bincode::Error),
}

/// Result type for search operations
pub type Result<T> = std::result::Result<T, SearchError>;

/// Query mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Trie membership only
    Exact,
    /// Trie prefix expansion
    Prefix,
    /// Edit-distance ranking
    Fuzzy,
    /// Dense-vector retrieval (empty until the index is ready)
    Semantic,
    /// Cascade, short-circuiting on an exact hit
    Smart,
    /// Cascade that always runs fuzzy/prefix alongside exact
    SmartAggressive,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Smart
    }
}

/// Method that produced a search result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Exact trie membership
    Exact,
    /// Trie prefix expansion
    Prefix,
    /// Edit-distance ranking
    Fuzzy,
    /// Dense-vector similarity
    Semantic,
}

impl SearchMethod {
    /// Ranking weight applied to this method's raw score.
    pub fn weight(&self) -> f64 {
        match self {
            SearchMethod::Exact => 1.0,
            SearchMethod::Prefix => 0.95,
            SearchMethod::Fuzzy => 0.80,
            SearchMethod::Semantic => 0.70,
        }
    }

    /// Stable label for per-method counters.
    pub fn label(&self) -> &'static str {
        match self {
            SearchMethod::Exact => "exact",
            SearchMethod::Prefix => "prefix",
            SearchMethod::Fuzzy => "fuzzy",
            SearchMethod::Semantic => "semantic",
        }
    }
}

/// Query options
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum results returned
    pub max_results: usize,
    /// Minimum raw method score for fuzzy/semantic hits
    pub min_score: f64,
    /// Query mode
    pub mode: SearchMode,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 10,
            min_score: 0.6,
            mode: SearchMode::Smart,
        }
    }
}

/// One ranked hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Original-form word
    pub word: String,
    /// Lemma of the word
    pub lemmatized_word: String,
    /// Raw score from the producing method, in `[0, 1]`
    pub score: f64,
    /// Which method produced the hit
    pub method: SearchMethod,
    /// Language of the corpus the hit came from
    pub language: String,
}

/// Query response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Query as submitted
    pub query: String,
    /// Query after normalization
    pub normalized_query: String,
    /// Ranked, deduplicated results
    pub results: Vec<SearchResult>,
    /// Total hits found before truncation to `max_results`
    pub total_found: usize,
    /// Languages represented in the results
    pub languages: Vec<String>,
    /// Mode the query ran under
    pub mode: SearchMode,
    /// Timing and per-method diagnostics
    pub metadata: SearchMetadata,
}

/// Query diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    /// Wall-clock query time in milliseconds
    pub search_time_ms: u64,
    /// Hits contributed per method, before dedup
    pub per_method_counts: BTreeMap<String, usize>,
    /// Set when semantic mode was requested before the index was ready
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Base64 (de)serialization for binary payloads embedded in JSON documents.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Base64 (de)serialization for optional binary payloads.
pub(crate) mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
