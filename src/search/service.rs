//! Search service
//!
//! The registry of live orchestrators, one per corpus. Responsibilities:
//! - lazy orchestrator construction, reusing persisted trie payloads whose
//!   `vocabulary_hash` still matches the corpus
//! - hot reload: a watcher task polls each live corpus's `vocabulary_hash`
//!   and atomically swaps in a fresh orchestrator on divergence; in-flight
//!   queries finish on the snapshot they started with
//! - the collaborator-facing API: `search`, `suggest`, `semantic_status`,
//!   `enable_semantic`, `rebuild_search`
//!
//! Search indexes are derived state. The service persists a small manifest
//! per corpus (`SearchIndexEntity`) recording which derived indexes exist
//! and for which vocabulary hash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::corpus::{CorpusEntity, CorpusManager};
use crate::versioning::{ResourceType, SaveOptions, VersionManager};

use super::fuzzy::FuzzyConfig;
use super::orchestrator::SearchOrchestrator;
use super::semantic::{semantic_resource_id, Embedder};
use super::trie::{TrieIndex, TrieIndexEntity};
use super::{Result, SearchError, SearchOptions, SearchResponse};

/// Search service configuration
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Hot-reload poll interval
    pub poll_interval: Duration,
    /// Fuzzy matcher tuning shared by all orchestrators
    pub fuzzy: FuzzyConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            fuzzy: FuzzyConfig::default(),
        }
    }
}

/// Semantic subsystem status for one corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticStatus {
    /// Whether `enable_semantic` has been requested
    pub enabled: bool,
    /// Whether the index is ready to serve queries
    pub ready: bool,
    /// Whether a build is currently running
    pub building: bool,
    /// Embedder model behind the index, once enabled
    pub model_name: Option<String>,
    /// Normalized vocabulary size of the corpus
    pub vocab_size: usize,
    /// Last build failure, if any
    pub error: Option<String>,
}

/// Options for `rebuild_search`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildOptions {
    /// Rebuild the trie even if its hash still matches
    pub rebuild_trie: bool,
    /// Rebuild the semantic index
    pub rebuild_semantic: bool,
    /// Discard persisted index payloads before rebuilding
    pub force: bool,
}

/// Persisted manifest of the derived indexes for one corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIndexEntity {
    /// Corpus the indexes derive from
    pub corpus_id: String,
    /// Vocabulary hash the indexes are valid for
    pub vocabulary_hash: String,
    /// Whether a trie payload exists
    pub has_trie: bool,
    /// Whether fuzzy search is available (always, once a corpus exists)
    pub has_fuzzy: bool,
    /// Whether a semantic payload exists for this hash
    pub has_semantic: bool,
    /// Record id of the trie payload
    pub trie_index_id: Option<String>,
    /// Record id of the semantic payload
    pub semantic_index_id: Option<String>,
}

/// Resource id of a trie index in the cold store.
pub fn trie_resource_id(corpus_id: &str) -> String {
    format!("trie:{corpus_id}")
}

/// Resource id of a search manifest in the cold store.
pub fn search_resource_id(corpus_id: &str) -> String {
    format!("search:{corpus_id}")
}

struct LiveEntry {
    orchestrator: RwLock<Arc<SearchOrchestrator>>,
    watcher_cancel: CancellationToken,
    semantic_requested: AtomicBool,
}

/// Per-corpus orchestrator registry with hot reload.
pub struct SearchService {
    corpora: Arc<CorpusManager>,
    vcm: Arc<VersionManager>,
    embedder: Arc<dyn Embedder>,
    config: SearchConfig,
    live: DashMap<String, Arc<LiveEntry>>,
    shutdown: CancellationToken,
}

impl SearchService {
    /// Create a search service over the corpus manager and an embedder.
    pub fn new(
        corpora: Arc<CorpusManager>,
        embedder: Arc<dyn Embedder>,
        config: SearchConfig,
    ) -> Arc<Self> {
        let vcm = Arc::clone(corpora.version_manager());
        Arc::new(Self {
            corpora,
            vcm,
            embedder,
            config,
            live: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run a query against a corpus.
    pub async fn search(
        self: &Arc<Self>,
        corpus_id: &str,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<SearchResponse> {
        let entry = self.ensure(corpus_id).await?;
        let orchestrator = entry.orchestrator.read().clone();
        orchestrator.search(query, opts).await
    }

    /// Prefix suggestions for a corpus.
    pub async fn suggest(
        self: &Arc<Self>,
        corpus_id: &str,
        prefix: &str,
        k: usize,
    ) -> Result<Vec<String>> {
        let entry = self.ensure(corpus_id).await?;
        let orchestrator = entry.orchestrator.read().clone();
        Ok(orchestrator.suggest(prefix, k))
    }

    /// Anagram lookup over the corpus signature buckets.
    pub async fn anagrams(self: &Arc<Self>, corpus_id: &str, word: &str) -> Result<Vec<String>> {
        let entry = self.ensure(corpus_id).await?;
        let orchestrator = entry.orchestrator.read().clone();
        let anagrams = orchestrator
            .corpus()
            .anagrams(word)
            .into_iter()
            .map(str::to_string)
            .collect();
        Ok(anagrams)
    }

    /// Semantic subsystem status for a corpus.
    pub async fn semantic_status(self: &Arc<Self>, corpus_id: &str) -> Result<SemanticStatus> {
        let entry = self.ensure(corpus_id).await?;
        let orchestrator = entry.orchestrator.read().clone();
        Ok(orchestrator.semantic_status())
    }

    /// Kick off the background semantic build for a corpus. Returns
    /// immediately; poll `semantic_status` for readiness.
    pub async fn enable_semantic(self: &Arc<Self>, corpus_id: &str) -> Result<()> {
        let entry = self.ensure(corpus_id).await?;
        entry.semantic_requested.store(true, Ordering::SeqCst);
        let orchestrator = entry.orchestrator.read().clone();
        orchestrator.enable_semantic(Arc::clone(&self.embedder), Arc::clone(&self.vcm));
        Ok(())
    }

    /// Rebuild derived indexes for a corpus and swap in a fresh
    /// orchestrator.
    pub async fn rebuild_search(
        self: &Arc<Self>,
        corpus_id: &str,
        opts: RebuildOptions,
    ) -> Result<()> {
        let corpus = self
            .corpora
            .get(corpus_id)
            .await?
            .ok_or_else(|| SearchError::CorpusNotFound(corpus_id.to_string()))?;

        if opts.force && opts.rebuild_semantic {
            self.vcm
                .delete(
                    ResourceType::SemanticIndex,
                    &semantic_resource_id(corpus_id, self.embedder.model_name()),
                    false,
                )
                .await?;
        }

        let force_trie = opts.rebuild_trie || opts.force;
        let orchestrator = self.build_orchestrator(corpus, force_trie).await?;

        let entry = self.ensure(corpus_id).await?;
        let rebuild_semantic =
            opts.rebuild_semantic || entry.semantic_requested.load(Ordering::SeqCst);
        let old = {
            let mut live = entry.orchestrator.write();
            std::mem::replace(&mut *live, Arc::clone(&orchestrator))
        };
        old.cancel_background();

        if rebuild_semantic {
            entry.semantic_requested.store(true, Ordering::SeqCst);
            orchestrator.enable_semantic(Arc::clone(&self.embedder), Arc::clone(&self.vcm));
        }
        Ok(())
    }

    /// Drop a corpus's live orchestrator and stop its watcher.
    pub fn evict(&self, corpus_id: &str) {
        if let Some((_, entry)) = self.live.remove(corpus_id) {
            entry.watcher_cancel.cancel();
            entry.orchestrator.read().cancel_background();
        }
    }

    /// Stop every watcher and drop all live orchestrators.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.live.iter() {
            entry.watcher_cancel.cancel();
            entry.orchestrator.read().cancel_background();
        }
        self.live.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn ensure(self: &Arc<Self>, corpus_id: &str) -> Result<Arc<LiveEntry>> {
        if let Some(entry) = self.live.get(corpus_id) {
            return Ok(Arc::clone(&entry));
        }

        let corpus = self
            .corpora
            .get(corpus_id)
            .await?
            .ok_or_else(|| SearchError::CorpusNotFound(corpus_id.to_string()))?;
        let orchestrator = self.build_orchestrator(corpus, false).await?;

        let ours = Arc::new(LiveEntry {
            orchestrator: RwLock::new(orchestrator),
            watcher_cancel: self.shutdown.child_token(),
            semantic_requested: AtomicBool::new(false),
        });

        // Another task may have raced us here; first insert wins, the
        // loser's orchestrator is dropped before anything observed it, and
        // only the winner gets a watcher.
        let stored = self
            .live
            .entry(corpus_id.to_string())
            .or_insert_with(|| Arc::clone(&ours))
            .clone();
        if Arc::ptr_eq(&stored, &ours) {
            self.spawn_watcher(corpus_id.to_string(), Arc::clone(&stored));
        }
        Ok(stored)
    }

    /// Build an orchestrator for a corpus snapshot, reusing the persisted
    /// trie when its vocabulary hash still matches.
    async fn build_orchestrator(
        &self,
        corpus: CorpusEntity,
        force_trie: bool,
    ) -> Result<Arc<SearchOrchestrator>> {
        let resource_id = trie_resource_id(&corpus.corpus_id);

        let mut trie = None;
        if !force_trie {
            if let Some(record) = self
                .vcm
                .get_latest(ResourceType::TrieIndex, &resource_id)
                .await?
            {
                if let Ok(content) = self.vcm.load_content(&record).await {
                    if let Ok(entity) = serde_json::from_value::<TrieIndexEntity>(content) {
                        if entity.vocabulary_hash == corpus.vocabulary_hash {
                            match TrieIndex::from_entity(&entity) {
                                Ok(loaded) => trie = Some((loaded, record.id)),
                                Err(e) => {
                                    tracing::warn!(
                                        resource = %resource_id,
                                        error = %e,
                                        "persisted trie unusable, rebuilding"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }

        let (trie, trie_record_id) = match trie {
            Some((trie, record_id)) => (trie, record_id),
            None => {
                let built = TrieIndex::build(&corpus.normalized_vocabulary)?;
                let entity = built.to_entity(&corpus.corpus_id, &corpus.vocabulary_hash);
                let record = self
                    .vcm
                    .save(
                        ResourceType::TrieIndex,
                        &resource_id,
                        serde_json::to_value(&entity)?,
                        SaveOptions::default(),
                    )
                    .await?;
                (built, record.id)
            }
        };

        self.upsert_manifest(&corpus, &trie_record_id).await?;

        Ok(Arc::new(SearchOrchestrator::new(
            Arc::new(corpus),
            trie,
            self.config.fuzzy.clone(),
        )))
    }

    async fn upsert_manifest(&self, corpus: &CorpusEntity, trie_record_id: &str) -> Result<()> {
        let semantic_record = self
            .vcm
            .get_latest(
                ResourceType::SemanticIndex,
                &semantic_resource_id(&corpus.corpus_id, self.embedder.model_name()),
            )
            .await?;
        let semantic_current = semantic_record.as_ref().is_some_and(|record| {
            record
                .metadata
                .get("vocabulary_hash")
                .and_then(serde_json::Value::as_str)
                == Some(corpus.vocabulary_hash.as_str())
        });

        let manifest = SearchIndexEntity {
            corpus_id: corpus.corpus_id.clone(),
            vocabulary_hash: corpus.vocabulary_hash.clone(),
            has_trie: true,
            has_fuzzy: true,
            has_semantic: semantic_current,
            trie_index_id: Some(trie_record_id.to_string()),
            semantic_index_id: semantic_current.then(|| semantic_record.unwrap().id),
        };

        self.vcm
            .save(
                ResourceType::SearchIndex,
                &search_resource_id(&corpus.corpus_id),
                serde_json::to_value(&manifest)?,
                SaveOptions::default(),
            )
            .await?;
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>, corpus_id: String, entry: Arc<LiveEntry>) {
        let service = Arc::clone(self);
        let cancel = entry.watcher_cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.reload_if_stale(&corpus_id, &entry).await {
                            tracing::warn!(corpus_id, error = %e, "hot reload pass failed");
                        }
                    }
                }
            }
        });
    }

    async fn reload_if_stale(
        self: &Arc<Self>,
        corpus_id: &str,
        entry: &Arc<LiveEntry>,
    ) -> Result<()> {
        let Some(corpus) = self.corpora.get(corpus_id).await? else {
            // Corpus deleted out from under us; retire the orchestrator
            self.evict(corpus_id);
            return Ok(());
        };

        let live_hash = entry.orchestrator.read().corpus().vocabulary_hash.clone();
        if corpus.vocabulary_hash == live_hash {
            return Ok(());
        }

        tracing::debug!(corpus_id, "vocabulary changed, swapping orchestrator");
        let fresh = self.build_orchestrator(corpus, false).await?;
        if entry.semantic_requested.load(Ordering::SeqCst) {
            fresh.enable_semantic(Arc::clone(&self.embedder), Arc::clone(&self.vcm));
        }

        let old = {
            let mut live = entry.orchestrator.write();
            std::mem::replace(&mut *live, fresh)
        };
        old.cancel_background();
        Ok(())
    }
}
