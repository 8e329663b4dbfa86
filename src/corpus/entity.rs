//! Corpus entity
//!
//! A corpus is a named set of vocabulary strings plus every derived map the
//! search stack needs: normalized forms, lemmas, signature buckets, and the
//! index tables linking them back to original words. The derived fields are
//! recomputed wholesale whenever vocabulary changes; `vocabulary_hash` over
//! the sorted normalized forms is the identity search indexes use to decide
//! whether they are stale.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::sha256_hex;

use super::normalize::{lemmatize, normalize_word, signature_key};

/// Corpus classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusType {
    /// Aggregating parent corpus
    Master,
    /// A dictionary-backed corpus
    Dictionary,
    /// A user-provided word list
    Wordlist,
    /// Anything else
    Custom,
}

/// A vocabulary corpus with derived search structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntity {
    /// Unique corpus id
    pub corpus_id: String,
    /// Unique human-facing name
    pub corpus_name: String,
    /// Corpus classification
    pub corpus_type: CorpusType,
    /// Language tag (ISO 639-1 code or English name)
    pub language: String,
    /// Parent corpus id, when part of a tree
    pub parent_id: Option<String>,
    /// Child corpus ids, when aggregating
    pub child_ids: Vec<String>,
    /// Whether this corpus aggregates children
    pub is_master: bool,
    /// Words added directly to this corpus (original forms)
    pub own_vocabulary: Vec<String>,
    /// Effective vocabulary: own words plus, for masters, the union over
    /// children (original forms, insertion order, unique)
    pub vocabulary: Vec<String>,
    /// Sorted unique normalized forms of `vocabulary`
    pub normalized_vocabulary: Vec<String>,
    /// Lemma of each `vocabulary` entry (parallel to `vocabulary`)
    pub lemmatized_vocabulary: Vec<String>,
    /// Signature-bucket key → indices into `normalized_vocabulary`
    pub signature_buckets: BTreeMap<String, Vec<usize>>,
    /// Original word → its index in `vocabulary`
    pub vocabulary_to_index: BTreeMap<String, usize>,
    /// Index into `normalized_vocabulary` → indices into `vocabulary`
    pub normalized_to_original_indices: BTreeMap<usize, Vec<usize>>,
    /// Lemma → indices into `vocabulary`
    pub lemma_to_word_indices: BTreeMap<String, Vec<usize>>,
    /// SHA-256 over the sorted normalized vocabulary
    pub vocabulary_hash: String,
}

impl CorpusEntity {
    /// Create an empty corpus.
    pub fn new(
        corpus_id: impl Into<String>,
        corpus_name: impl Into<String>,
        corpus_type: CorpusType,
        language: impl Into<String>,
    ) -> Self {
        let mut corpus = Self {
            corpus_id: corpus_id.into(),
            corpus_name: corpus_name.into(),
            corpus_type,
            language: language.into(),
            parent_id: None,
            child_ids: Vec::new(),
            is_master: corpus_type == CorpusType::Master,
            own_vocabulary: Vec::new(),
            vocabulary: Vec::new(),
            normalized_vocabulary: Vec::new(),
            lemmatized_vocabulary: Vec::new(),
            signature_buckets: BTreeMap::new(),
            vocabulary_to_index: BTreeMap::new(),
            normalized_to_original_indices: BTreeMap::new(),
            lemma_to_word_indices: BTreeMap::new(),
            vocabulary_hash: String::new(),
        };
        corpus.rebuild_derived();
        corpus
    }

    /// Add words (original forms). Duplicates are ignored. Returns how many
    /// were actually added.
    pub fn add_words<I, S>(&mut self, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for word in words {
            let word = word.as_ref().trim();
            if word.is_empty() || self.vocabulary_to_index.contains_key(word) {
                continue;
            }
            self.own_vocabulary.push(word.to_string());
            self.vocabulary.push(word.to_string());
            self.vocabulary_to_index
                .insert(word.to_string(), self.vocabulary.len() - 1);
            added += 1;
        }
        if added > 0 {
            self.rebuild_derived();
        }
        added
    }

    /// Remove words by original form. Returns how many were removed.
    pub fn remove_words<I, S>(&mut self, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for word in words {
            let word = word.as_ref();
            let before = self.vocabulary.len();
            self.own_vocabulary.retain(|w| w != word);
            self.vocabulary.retain(|w| w != word);
            if self.vocabulary.len() < before {
                removed += 1;
            }
        }
        if removed > 0 {
            self.rebuild_derived();
        }
        removed
    }

    /// Replace the effective vocabulary with an aggregation result (master
    /// corpora: own words plus the union over children).
    pub fn set_aggregated_vocabulary(&mut self, words: Vec<String>) {
        self.vocabulary = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for word in words {
            let word = word.trim().to_string();
            if !word.is_empty() && seen.insert(word.clone()) {
                self.vocabulary.push(word);
            }
        }
        self.rebuild_derived();
    }

    /// Recompute every derived structure from `vocabulary`.
    pub fn rebuild_derived(&mut self) {
        self.vocabulary_to_index = self
            .vocabulary
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i))
            .collect();

        self.lemmatized_vocabulary = self
            .vocabulary
            .iter()
            .map(|w| lemmatize(&normalize_word(w), &self.language))
            .collect();

        // Sorted unique normalized forms
        let mut normalized: Vec<String> = self.vocabulary.iter().map(|w| normalize_word(w)).collect();
        let per_word_normalized = normalized.clone();
        normalized.sort_unstable();
        normalized.dedup();
        self.normalized_vocabulary = normalized;

        self.normalized_to_original_indices = BTreeMap::new();
        for (orig_idx, norm) in per_word_normalized.iter().enumerate() {
            let norm_idx = self
                .normalized_vocabulary
                .binary_search(norm)
                .expect("normalized form came from this vocabulary");
            self.normalized_to_original_indices
                .entry(norm_idx)
                .or_default()
                .push(orig_idx);
        }

        self.lemma_to_word_indices = BTreeMap::new();
        for (orig_idx, lemma) in self.lemmatized_vocabulary.iter().enumerate() {
            self.lemma_to_word_indices
                .entry(lemma.clone())
                .or_default()
                .push(orig_idx);
        }

        self.signature_buckets = BTreeMap::new();
        for (norm_idx, norm) in self.normalized_vocabulary.iter().enumerate() {
            self.signature_buckets
                .entry(signature_key(norm))
                .or_default()
                .push(norm_idx);
        }

        self.vocabulary_hash = sha256_hex(self.normalized_vocabulary.join("\n").as_bytes());
    }

    /// Original words behind a normalized form.
    pub fn originals_for_normalized(&self, normalized: &str) -> Vec<&str> {
        match self.normalized_vocabulary.binary_search_by(|w| w.as_str().cmp(normalized)) {
            Ok(norm_idx) => self
                .normalized_to_original_indices
                .get(&norm_idx)
                .map(|indices| {
                    indices
                        .iter()
                        .map(|&i| self.vocabulary[i].as_str())
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Lemma of the first original word behind a normalized form.
    pub fn lemma_for_normalized(&self, normalized: &str) -> Option<&str> {
        match self.normalized_vocabulary.binary_search_by(|w| w.as_str().cmp(normalized)) {
            Ok(norm_idx) => self
                .normalized_to_original_indices
                .get(&norm_idx)
                .and_then(|indices| indices.first())
                .map(|&i| self.lemmatized_vocabulary[i].as_str()),
            Err(_) => None,
        }
    }

    /// Whether a normalized form is in the corpus.
    pub fn contains_normalized(&self, normalized: &str) -> bool {
        self.normalized_vocabulary
            .binary_search_by(|w| w.as_str().cmp(normalized))
            .is_ok()
    }

    /// Exact anagrams of a word (by signature bucket), as original forms.
    /// The word itself is excluded.
    pub fn anagrams(&self, word: &str) -> Vec<&str> {
        let normalized = normalize_word(word);
        let Some(bucket) = self.signature_buckets.get(&signature_key(&normalized)) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter(|&&norm_idx| self.normalized_vocabulary[norm_idx] != normalized)
            .flat_map(|&norm_idx| {
                self.normalized_to_original_indices
                    .get(&norm_idx)
                    .into_iter()
                    .flatten()
                    .map(|&i| self.vocabulary[i].as_str())
            })
            .collect()
    }

    /// Number of unique normalized forms.
    pub fn normalized_len(&self) -> usize {
        self.normalized_vocabulary.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus_with(words: &[&str]) -> CorpusEntity {
        let mut corpus = CorpusEntity::new("c1", "test", CorpusType::Dictionary, "en");
        corpus.add_words(words.iter().copied());
        corpus
    }

    #[test]
    fn test_add_words_builds_derived_maps() {
        let corpus = corpus_with(&["Hello", "help", "Café"]);

        assert_eq!(corpus.vocabulary.len(), 3);
        assert!(corpus.contains_normalized("hello"));
        assert!(corpus.contains_normalized("cafe"));
        assert_eq!(corpus.originals_for_normalized("cafe"), vec!["Café"]);
        assert_eq!(corpus.vocabulary_to_index["help"], 1);
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut corpus = corpus_with(&["hello"]);
        assert_eq!(corpus.add_words(["hello"]), 0);
        assert_eq!(corpus.vocabulary.len(), 1);
    }

    #[test]
    fn test_vocabulary_hash_tracks_normalized_content() {
        let a = corpus_with(&["Hello", "Help"]);
        let b = corpus_with(&["help", "hello"]);
        // Same normalized set, different original order and casing
        assert_eq!(a.vocabulary_hash, b.vocabulary_hash);

        let c = corpus_with(&["hello", "help", "helicopter"]);
        assert_ne!(a.vocabulary_hash, c.vocabulary_hash);
    }

    #[test]
    fn test_remove_words_updates_hash() {
        let mut corpus = corpus_with(&["hello", "help"]);
        let before = corpus.vocabulary_hash.clone();
        assert_eq!(corpus.remove_words(["help"]), 1);
        assert_ne!(corpus.vocabulary_hash, before);
        assert!(!corpus.contains_normalized("help"));
    }

    #[test]
    fn test_anagrams_via_signature_buckets() {
        let corpus = corpus_with(&["listen", "silent", "enlist", "hello"]);
        let mut anagrams = corpus.anagrams("listen");
        anagrams.sort_unstable();
        assert_eq!(anagrams, vec!["enlist", "silent"]);
        assert!(corpus.anagrams("hello").is_empty());
    }

    #[test]
    fn test_lemma_maps() {
        let corpus = corpus_with(&["running", "runs"]);
        let indices = corpus.lemma_to_word_indices.get("run").unwrap();
        assert_eq!(indices.len(), 2);
        assert_eq!(corpus.lemma_for_normalized("running"), Some("run"));
    }

    #[test]
    fn test_set_aggregated_vocabulary() {
        let mut parent = CorpusEntity::new("p", "parent", CorpusType::Master, "en");
        parent.set_aggregated_vocabulary(vec![
            "alpha".into(),
            "beta".into(),
            "alpha".into(), // duplicate collapses
        ]);
        assert_eq!(parent.vocabulary.len(), 2);
        assert!(parent.contains_normalized("beta"));
    }
}
