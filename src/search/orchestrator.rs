//! Search orchestrator
//!
//! One orchestrator per live corpus snapshot. It owns the trie, the fuzzy
//! matcher, and an optional semantic index that is built off the query path:
//! `enable_semantic` spawns a background task, semantic queries return empty
//! with a "not ready" reason until the build lands, and the ready flag flips
//! only after the index has been persisted.
//!
//! The orchestrator is immutable after construction; hot reload replaces the
//! whole orchestrator rather than mutating one in place, so in-flight
//! queries finish against the snapshot they started with.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::corpus::{normalize_word, CorpusEntity};
use crate::versioning::{ResourceType, SaveOptions, VersionManager};

use super::fuzzy::{FuzzyConfig, FuzzyMatcher};
use super::semantic::{semantic_resource_id, Embedder, SemanticIndex, SemanticIndexEntity};
use super::service::SemanticStatus;
use super::trie::TrieIndex;
use super::{
    Result, SearchError, SearchMetadata, SearchMethod, SearchMode, SearchOptions, SearchResponse,
    SearchResult,
};

/// Query-embedding cache capacity per orchestrator.
const QUERY_CACHE_SIZE: usize = 512;

enum SemanticState {
    Disabled,
    Building,
    Ready(Arc<SemanticIndex>),
    Failed(String),
}

struct SemanticSlot {
    state: RwLock<SemanticState>,
    embedder: RwLock<Option<Arc<dyn Embedder>>>,
    cancel: CancellationToken,
}

/// Cascading multi-method searcher over one corpus snapshot.
pub struct SearchOrchestrator {
    corpus: Arc<CorpusEntity>,
    trie: TrieIndex,
    fuzzy: FuzzyMatcher,
    semantic: SemanticSlot,
    query_cache: Mutex<LruCache<String, Arc<Vec<f32>>>>,
}

impl SearchOrchestrator {
    /// Build an orchestrator over a corpus snapshot and its trie.
    pub fn new(corpus: Arc<CorpusEntity>, trie: TrieIndex, fuzzy_config: FuzzyConfig) -> Self {
        Self {
            corpus,
            trie,
            fuzzy: FuzzyMatcher::new(fuzzy_config),
            semantic: SemanticSlot {
                state: RwLock::new(SemanticState::Disabled),
                embedder: RwLock::new(None),
                cancel: CancellationToken::new(),
            },
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero"),
            )),
        }
    }

    /// The corpus snapshot this orchestrator serves.
    pub fn corpus(&self) -> &Arc<CorpusEntity> {
        &self.corpus
    }

    /// Run a query.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        let started = Instant::now();
        let normalized = normalize_word(query);
        let k = opts.max_results.max(1);

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut reason = None;
        let mut hits: Vec<SearchResult> = Vec::new();

        match opts.mode {
            SearchMode::Exact => {
                hits.extend(self.exact_hits(&normalized, &mut counts));
            }
            SearchMode::Prefix => {
                hits.extend(self.prefix_hits(&normalized, k, &mut counts));
            }
            SearchMode::Fuzzy => {
                hits.extend(self.fuzzy_hits(&normalized, k, opts.min_score, &mut counts));
            }
            SearchMode::Semantic => match self.semantic_index() {
                Some(index) => {
                    hits.extend(
                        self.semantic_hits(&index, &normalized, k, opts.min_score, &mut counts)
                            .await?,
                    );
                }
                None => reason = Some("not_ready".to_string()),
            },
            SearchMode::Smart | SearchMode::SmartAggressive => {
                let exact = self.exact_hits(&normalized, &mut counts);
                let short_circuit =
                    !exact.is_empty() && opts.mode == SearchMode::Smart;
                hits.extend(exact);

                if !short_circuit {
                    hits.extend(self.fuzzy_hits(&normalized, k, opts.min_score, &mut counts));
                    hits.extend(self.prefix_hits(&normalized, k, &mut counts));

                    let unique = count_unique(&hits);
                    if unique < k {
                        if let Some(index) = self.semantic_index() {
                            hits.extend(
                                self.semantic_hits(
                                    &index,
                                    &normalized,
                                    k,
                                    opts.min_score,
                                    &mut counts,
                                )
                                .await?,
                            );
                        }
                    }
                }
            }
        }

        let (results, total_found) = merge_and_rank(hits, k);
        let languages = if results.is_empty() {
            Vec::new()
        } else {
            vec![self.corpus.language.clone()]
        };

        Ok(SearchResponse {
            query: query.to_string(),
            normalized_query: normalized,
            results,
            total_found,
            languages,
            mode: opts.mode,
            metadata: SearchMetadata {
                search_time_ms: started.elapsed().as_millis() as u64,
                per_method_counts: counts,
                reason,
            },
        })
    }

    /// Prefix suggestions as original-form words.
    pub fn suggest(&self, prefix: &str, k: usize) -> Vec<String> {
        let normalized = normalize_word(prefix);
        self.trie
            .prefix(&normalized, k)
            .into_iter()
            .filter_map(|norm| {
                self.corpus
                    .originals_for_normalized(&norm)
                    .first()
                    .map(|w| w.to_string())
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Semantic lifecycle
    // -----------------------------------------------------------------------

    /// Start the background semantic build. No-op when already building or
    /// ready; a previous failure is retried.
    pub fn enable_semantic(
        self: &Arc<Self>,
        embedder: Arc<dyn Embedder>,
        vcm: Arc<VersionManager>,
    ) {
        {
            let mut state = self.semantic.state.write();
            match &*state {
                SemanticState::Building | SemanticState::Ready(_) => return,
                SemanticState::Disabled | SemanticState::Failed(_) => {
                    *state = SemanticState::Building;
                }
            }
            *self.semantic.embedder.write() = Some(Arc::clone(&embedder));
        }

        let orchestrator = Arc::clone(self);
        let cancel = self.semantic.cancel.clone();
        tokio::spawn(async move {
            let outcome = orchestrator
                .build_or_load_semantic(embedder, vcm, &cancel)
                .await;
            let mut state = orchestrator.semantic.state.write();
            match outcome {
                Ok(index) => {
                    tracing::debug!(
                        corpus_id = %orchestrator.corpus.corpus_id,
                        rows = index.num_embeddings(),
                        "semantic index ready"
                    );
                    *state = SemanticState::Ready(index);
                }
                Err(SearchError::Cancelled) => {
                    *state = SemanticState::Disabled;
                }
                Err(e) => {
                    tracing::warn!(
                        corpus_id = %orchestrator.corpus.corpus_id,
                        error = %e,
                        "semantic index build failed"
                    );
                    *state = SemanticState::Failed(e.to_string());
                }
            }
        });
    }

    async fn build_or_load_semantic(
        &self,
        embedder: Arc<dyn Embedder>,
        vcm: Arc<VersionManager>,
        cancel: &CancellationToken,
    ) -> Result<Arc<SemanticIndex>> {
        let resource_id =
            semantic_resource_id(&self.corpus.corpus_id, embedder.model_name());

        // Fast path: a persisted index for this exact vocabulary
        if let Some(record) = vcm
            .get_latest(ResourceType::SemanticIndex, &resource_id)
            .await?
        {
            if let Ok(content) = vcm.load_content(&record).await {
                if let Ok(entity) = serde_json::from_value::<SemanticIndexEntity>(content) {
                    if entity.vocabulary_hash == self.corpus.vocabulary_hash {
                        match SemanticIndex::from_entity(&entity) {
                            Ok(index) => return Ok(Arc::new(index)),
                            Err(e) => {
                                tracing::warn!(
                                    resource = %resource_id,
                                    error = %e,
                                    "persisted semantic index unusable, rebuilding"
                                );
                            }
                        }
                    }
                }
            }
        }

        let index =
            SemanticIndex::build(&self.corpus, embedder.as_ref(), Some(cancel)).await?;
        let entity = index.to_entity()?;

        // Persist first; readiness flips only after the save lands.
        vcm.save(
            ResourceType::SemanticIndex,
            &resource_id,
            serde_json::to_value(&entity)?,
            SaveOptions::default(),
        )
        .await?;

        Ok(Arc::new(index))
    }

    /// Status snapshot for collaborators.
    pub fn semantic_status(&self) -> SemanticStatus {
        let state = self.semantic.state.read();
        let model_name = self
            .semantic
            .embedder
            .read()
            .as_ref()
            .map(|e| e.model_name().to_string());
        let (enabled, ready, building, error) = match &*state {
            SemanticState::Disabled => (false, false, false, None),
            SemanticState::Building => (true, false, true, None),
            SemanticState::Ready(_) => (true, true, false, None),
            SemanticState::Failed(e) => (true, false, false, Some(e.clone())),
        };
        SemanticStatus {
            enabled,
            ready,
            building,
            model_name,
            vocab_size: self.corpus.normalized_len(),
            error,
        }
    }

    /// Cancel any in-flight semantic build (used when this orchestrator is
    /// being replaced).
    pub fn cancel_background(&self) {
        self.semantic.cancel.cancel();
    }

    fn semantic_index(&self) -> Option<Arc<SemanticIndex>> {
        match &*self.semantic.state.read() {
            SemanticState::Ready(index) => Some(Arc::clone(index)),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Per-method hit producers
    // -----------------------------------------------------------------------

    fn exact_hits(&self, normalized: &str, counts: &mut BTreeMap<String, usize>) -> Vec<SearchResult> {
        let mut out = Vec::new();
        if self.trie.contains(normalized) {
            if let Some(result) = self.result_for(normalized, 1.0, SearchMethod::Exact) {
                out.push(result);
            }
        }
        *counts.entry(SearchMethod::Exact.label().to_string()).or_default() += out.len();
        out
    }

    fn prefix_hits(
        &self,
        normalized: &str,
        k: usize,
        counts: &mut BTreeMap<String, usize>,
    ) -> Vec<SearchResult> {
        let out: Vec<SearchResult> = self
            .trie
            .prefix(normalized, k)
            .into_iter()
            .filter_map(|norm| self.result_for(&norm, 1.0, SearchMethod::Prefix))
            .collect();
        *counts.entry(SearchMethod::Prefix.label().to_string()).or_default() += out.len();
        out
    }

    fn fuzzy_hits(
        &self,
        normalized: &str,
        k: usize,
        min_score: f64,
        counts: &mut BTreeMap<String, usize>,
    ) -> Vec<SearchResult> {
        let candidates = self.fuzzy_candidates(normalized);
        let out: Vec<SearchResult> = self
            .fuzzy
            .rank(normalized, candidates.iter().map(String::as_str), k, min_score)
            .into_iter()
            .filter_map(|hit| self.result_for(&hit.word, hit.score, SearchMethod::Fuzzy))
            .collect();
        *counts.entry(SearchMethod::Fuzzy.label().to_string()).or_default() += out.len();
        out
    }

    async fn semantic_hits(
        &self,
        index: &Arc<SemanticIndex>,
        normalized: &str,
        k: usize,
        min_score: f64,
        counts: &mut BTreeMap<String, usize>,
    ) -> Result<Vec<SearchResult>> {
        let query_vec = self.embed_query(normalized).await?;
        let out: Vec<SearchResult> = index
            .search(&query_vec, k, min_score)
            .into_iter()
            .filter_map(|hit| self.result_for(&hit.word, hit.score, SearchMethod::Semantic))
            .collect();
        *counts.entry(SearchMethod::Semantic.label().to_string()).or_default() += out.len();
        Ok(out)
    }

    /// Candidate set for fuzzy ranking: the query's signature bucket (exact
    /// anagram class) plus the corpus slice inside the length window.
    fn fuzzy_candidates(&self, normalized: &str) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let sig = crate::corpus::signature_key(normalized);
        if let Some(bucket) = self.corpus.signature_buckets.get(&sig) {
            for &norm_idx in bucket {
                let word = &self.corpus.normalized_vocabulary[norm_idx];
                if seen.insert(word.clone()) {
                    candidates.push(word.clone());
                }
            }
        }

        let query_len = normalized.chars().count();
        let window = self.fuzzy.config().max_length_delta;
        for word in &self.corpus.normalized_vocabulary {
            if word.chars().count().abs_diff(query_len) <= window && seen.insert(word.clone()) {
                candidates.push(word.clone());
            }
        }
        candidates
    }

    async fn embed_query(&self, normalized: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(cached) = self.query_cache.lock().get(normalized) {
            return Ok(Arc::clone(cached));
        }
        let embedder = self
            .semantic
            .embedder
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SearchError::Semantic("semantic index not enabled".to_string()))?;

        let vector = embedder
            .embed_batch(&[normalized.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SearchError::Embedding("embedder returned no vector".to_string()))?;
        let vector = Arc::new(vector);
        self.query_cache
            .lock()
            .put(normalized.to_string(), Arc::clone(&vector));
        Ok(vector)
    }

    fn result_for(&self, normalized: &str, score: f64, method: SearchMethod) -> Option<SearchResult> {
        let originals = self.corpus.originals_for_normalized(normalized);
        let word = originals.first()?.to_string();
        let lemmatized_word = self
            .corpus
            .lemma_for_normalized(normalized)
            .unwrap_or(normalized)
            .to_string();
        Some(SearchResult {
            word,
            lemmatized_word,
            score,
            method,
            language: self.corpus.language.clone(),
        })
    }
}

impl Drop for SearchOrchestrator {
    fn drop(&mut self) {
        self.semantic.cancel.cancel();
    }
}

/// Number of distinct canonical words among hits.
fn count_unique(hits: &[SearchResult]) -> usize {
    hits.iter()
        .map(|h| normalize_word(&h.word))
        .collect::<std::collections::HashSet<_>>()
        .len()
}

/// Dedup by canonical word keeping the highest-weighted hit, then sort by
/// weighted score descending (stable under ties). Returns the truncated
/// results and the pre-truncation unique count.
fn merge_and_rank(hits: Vec<SearchResult>, k: usize) -> (Vec<SearchResult>, usize) {
    let mut best: BTreeMap<String, SearchResult> = BTreeMap::new();
    for hit in hits {
        let canonical = normalize_word(&hit.word);
        let weighted = hit.score * hit.method.weight();
        match best.get(&canonical) {
            Some(existing) if existing.score * existing.method.weight() >= weighted => {}
            _ => {
                best.insert(canonical, hit);
            }
        }
    }

    let total = best.len();
    let mut merged: Vec<SearchResult> = best.into_values().collect();
    merged.sort_by(|a, b| {
        let wa = a.score * a.method.weight();
        let wb = b.score * b.method.weight();
        wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(k);
    (merged, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::CorpusType;
    use crate::search::fuzzy::FuzzyConfig;

    fn orchestrator() -> SearchOrchestrator {
        let mut corpus = CorpusEntity::new("c1", "test", CorpusType::Dictionary, "en");
        corpus.add_words(["hello", "help", "helicopter", "xenon"]);
        let trie = TrieIndex::build(&corpus.normalized_vocabulary).unwrap();
        SearchOrchestrator::new(Arc::new(corpus), trie, FuzzyConfig::default())
    }

    #[tokio::test]
    async fn test_smart_exact_hit_short_circuits() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .search("hello", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].word, "hello");
        assert_eq!(response.results[0].method, SearchMethod::Exact);
        assert!((response.results[0].score - 1.0).abs() < 1e-9);
        assert_eq!(response.normalized_query, "hello");
        // Short-circuit means no fuzzy pass ran
        assert!(!response.metadata.per_method_counts.contains_key("fuzzy"));
    }

    #[tokio::test]
    async fn test_smart_falls_back_to_fuzzy() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .search(
                "helpp",
                &SearchOptions {
                    max_results: 5,
                    min_score: 0.6,
                    mode: SearchMode::Smart,
                },
            )
            .await
            .unwrap();

        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].word, "help");
        assert_eq!(response.results[0].method, SearchMethod::Fuzzy);
        assert!(response.results[0].score >= 0.8);
    }

    #[tokio::test]
    async fn test_smart_aggressive_runs_past_exact() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .search(
                "help",
                &SearchOptions {
                    max_results: 10,
                    min_score: 0.0,
                    mode: SearchMode::SmartAggressive,
                },
            )
            .await
            .unwrap();

        // Exact winner plus prefix/fuzzy contributions
        assert_eq!(response.results[0].word, "help");
        assert!(response.results.len() > 1);
        assert!(response.metadata.per_method_counts.contains_key("prefix"));
    }

    #[tokio::test]
    async fn test_results_sorted_by_weighted_score_with_dedup() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .search(
                "hel",
                &SearchOptions {
                    max_results: 10,
                    min_score: 0.3,
                    mode: SearchMode::SmartAggressive,
                },
            )
            .await
            .unwrap();

        // One hit per canonical word
        let words: Vec<&str> = response.results.iter().map(|r| r.word.as_str()).collect();
        let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
        assert_eq!(words.len(), unique.len());

        // Weighted ordering is non-increasing
        let weighted: Vec<f64> = response
            .results
            .iter()
            .map(|r| r.score * r.method.weight())
            .collect();
        for pair in weighted.windows(2) {
            assert!(pair[0] + 1e-12 >= pair[1]);
        }
    }

    #[tokio::test]
    async fn test_semantic_mode_before_enable_reports_not_ready() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .search(
                "joyful",
                &SearchOptions {
                    mode: SearchMode::Semantic,
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(response.results.is_empty());
        assert_eq!(response.metadata.reason.as_deref(), Some("not_ready"));

        let status = orchestrator.semantic_status();
        assert!(!status.ready);
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn test_suggest_returns_original_forms() {
        let orchestrator = orchestrator();
        let suggestions = orchestrator.suggest("he", 10);
        assert_eq!(suggestions, vec!["helicopter", "hello", "help"]);
        assert_eq!(orchestrator.suggest("he", 2).len(), 2);
    }

    #[tokio::test]
    async fn test_exact_mode_misses_cleanly() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .search(
                "zebra",
                &SearchOptions {
                    mode: SearchMode::Exact,
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.total_found, 0);
    }
}
