//! Fuzzy matcher
//!
//! Ranks candidate words against a query by combining a whole-string
//! weighted ratio with a token-set ratio (both normalized Levenshtein
//! under the hood), then damping scores where the candidate is much longer
//! than the query. Candidates pass through a cheap gate first so the
//! scoring work only runs on plausible matches.
//!
//! Ties break deterministically: higher score, then shorter candidate, then
//! lexicographic order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

/// Fuzzy matcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyConfig {
    /// Maximum length difference a candidate may have from the query
    pub max_length_delta: usize,
    /// Queries at or below this length must share a first character with
    /// the candidate
    pub short_query_len: usize,
    /// Blend between whole-string ratio and token-set ratio
    pub token_weight: f64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            max_length_delta: 3,
            short_query_len: 4,
            token_weight: 0.5,
        }
    }
}

/// A scored fuzzy hit.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyHit {
    /// Candidate word (normalized form)
    pub word: String,
    /// Similarity score in `[0, 1]`
    pub score: f64,
}

/// Edit-distance ranking over candidate words.
#[derive(Debug, Clone, Default)]
pub struct FuzzyMatcher {
    config: FuzzyConfig,
}

impl FuzzyMatcher {
    /// Create a matcher with the given configuration.
    pub fn new(config: FuzzyConfig) -> Self {
        Self { config }
    }

    /// The configuration this matcher runs with.
    pub fn config(&self) -> &FuzzyConfig {
        &self.config
    }

    /// Cheap pre-filter: length window plus a shared first character for
    /// short queries.
    pub fn gate(&self, query: &str, candidate: &str) -> bool {
        let ql = query.chars().count();
        let cl = candidate.chars().count();
        if ql.abs_diff(cl) > self.config.max_length_delta {
            return false;
        }
        if ql <= self.config.short_query_len {
            return query.chars().next() == candidate.chars().next();
        }
        true
    }

    /// Similarity score in `[0, 1]`.
    pub fn score(&self, query: &str, candidate: &str) -> f64 {
        let whole = normalized_levenshtein(query, candidate);
        let token = token_set_ratio(query, candidate);
        let blended =
            whole * (1.0 - self.config.token_weight) + token * self.config.token_weight;
        blended * length_damp(query, candidate)
    }

    /// Rank candidates against a query. Gate, score, threshold, sort, and
    /// truncate to `k`.
    pub fn rank<'a, I>(&self, query: &str, candidates: I, k: usize, min_score: f64) -> Vec<FuzzyHit>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hits: Vec<FuzzyHit> = candidates
            .into_iter()
            .filter(|candidate| self.gate(query, candidate))
            .filter_map(|candidate| {
                let score = self.score(query, candidate);
                (score >= min_score).then(|| FuzzyHit {
                    word: candidate.to_string(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.word.len().cmp(&b.word.len()))
                .then_with(|| a.word.cmp(&b.word))
        });
        hits.truncate(k);
        hits
    }
}

/// Token-set ratio: compare the sorted token intersection against each
/// side's full sorted token string; single-token inputs reduce to plain
/// normalized Levenshtein.
fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection: Vec<&str> = tokens_a.intersection(&tokens_b).copied().collect();
    let joined_inter = intersection.join(" ");
    let joined_a = tokens_a.iter().copied().collect::<Vec<_>>().join(" ");
    let joined_b = tokens_b.iter().copied().collect::<Vec<_>>().join(" ");

    let inter_vs_a = normalized_levenshtein(&joined_inter, &joined_a);
    let inter_vs_b = normalized_levenshtein(&joined_inter, &joined_b);
    let a_vs_b = normalized_levenshtein(&joined_a, &joined_b);

    inter_vs_a.max(inter_vs_b).max(a_vs_b)
}

/// Damp scores where the candidate dwarfs the query: a two-character query
/// should not score highly against a ten-character word just because every
/// one of its characters appears there.
fn length_damp(query: &str, candidate: &str) -> f64 {
    let ql = query.chars().count() as f64;
    let cl = candidate.chars().count() as f64;
    if cl <= ql * 2.0 || cl == 0.0 {
        1.0
    } else {
        (ql * 2.0 / cl).max(0.25)
    }
}
