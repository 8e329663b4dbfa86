//! Trie + bloom membership index
//!
//! Exact and prefix lookups over the corpus's normalized vocabulary. The
//! trie is an `fst::Set` (compact, ordered, serializes to a flat byte
//! buffer); a bloom filter sized for ~1% false positives sits in front of it
//! to reject absent words without touching the trie. The bloom can say "maybe"
//! wrongly but never "no" wrongly, and the trie is always consulted on
//! "maybe", so `contains` has no false negatives and no false positives.
//!
//! Queries are assumed pre-normalized; the caller owns that contract.

use bloomfilter::Bloom;
use fst::automaton::Str;
use fst::{Automaton, IntoStreamer, Set, SetBuilder, Streamer};
use serde::{Deserialize, Serialize};

use super::{b64, Result, SearchError};

/// Target bloom false-positive rate.
const BLOOM_FP_RATE: f64 = 0.01;

/// Fixed SIP-key seed. Building the same vocabulary twice must produce
/// byte-identical bloom payloads, otherwise content-hash dedup of persisted
/// trie entities can never hit.
const BLOOM_SEED: [u8; 32] = *b"lexarc-trie-bloom-seed-v1.......";

/// Persisted form of a trie index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrieIndexEntity {
    /// Corpus this index was built from
    pub corpus_id: String,
    /// Vocabulary hash the index is valid for
    pub vocabulary_hash: String,
    /// fst set bytes
    #[serde(with = "b64")]
    pub serialized_trie: Vec<u8>,
    /// Bloom filter bitmap
    #[serde(with = "b64")]
    pub bloom_bits: Vec<u8>,
    /// Bloom filter bit count
    pub bloom_bit_count: u64,
    /// Bloom filter hash function count
    pub bloom_hashes: u32,
    /// Bloom filter SIP keys
    pub bloom_sip_keys: [(u64, u64); 2],
}

/// In-memory trie + bloom pair.
pub struct TrieIndex {
    set: Set<Vec<u8>>,
    bloom: Bloom<str>,
}

impl TrieIndex {
    /// Build from normalized vocabulary. Input need not be sorted; it is
    /// sorted and deduplicated here because fst construction requires it.
    pub fn build<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let mut sorted: Vec<&str> = words.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut builder = SetBuilder::memory();
        for word in &sorted {
            builder
                .insert(word)
                .map_err(|e| SearchError::Trie(e.to_string()))?;
        }
        let bytes = builder
            .into_inner()
            .map_err(|e| SearchError::Trie(e.to_string()))?;
        let set = Set::new(bytes).map_err(|e| SearchError::Trie(e.to_string()))?;

        let mut bloom =
            Bloom::new_for_fp_rate_with_seed(sorted.len().max(1), BLOOM_FP_RATE, &BLOOM_SEED);
        for word in &sorted {
            bloom.set(*word);
        }

        Ok(Self { set, bloom })
    }

    /// Exact membership. Bloom first; the trie confirms every bloom "maybe".
    pub fn contains(&self, query: &str) -> bool {
        if !self.bloom.check(query) {
            return false;
        }
        self.set.contains(query)
    }

    /// Up to `k` words under a prefix, in lexicographic order.
    pub fn prefix(&self, prefix: &str, k: usize) -> Vec<String> {
        let mut out = Vec::new();
        if k == 0 {
            return out;
        }
        let matcher = Str::new(prefix).starts_with();
        let mut stream = self.set.search(matcher).into_stream();
        while let Some(bytes) = stream.next() {
            out.push(String::from_utf8_lossy(bytes).into_owned());
            if out.len() >= k {
                break;
            }
        }
        out
    }

    /// Number of words in the trie.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the trie is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Snapshot into the persisted form.
    pub fn to_entity(&self, corpus_id: &str, vocabulary_hash: &str) -> TrieIndexEntity {
        TrieIndexEntity {
            corpus_id: corpus_id.to_string(),
            vocabulary_hash: vocabulary_hash.to_string(),
            serialized_trie: self.set.as_fst().as_bytes().to_vec(),
            bloom_bits: self.bloom.bitmap(),
            bloom_bit_count: self.bloom.number_of_bits(),
            bloom_hashes: self.bloom.number_of_hash_functions(),
            bloom_sip_keys: self.bloom.sip_keys(),
        }
    }

    /// Rehydrate from the persisted form.
    pub fn from_entity(entity: &TrieIndexEntity) -> Result<Self> {
        let set = Set::new(entity.serialized_trie.clone())
            .map_err(|e| SearchError::Trie(format!("corrupt fst payload: {e}")))?;
        let bloom = Bloom::from_existing(
            &entity.bloom_bits,
            entity.bloom_bit_count,
            entity.bloom_hashes,
            entity.bloom_sip_keys,
        );
        Ok(Self { set, bloom })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> TrieIndex {
        TrieIndex::build(&["hello", "help", "helicopter", "xenon"]).unwrap()
    }

    #[test]
    fn test_contains_has_no_false_negatives() {
        let trie = index();
        for word in ["hello", "help", "helicopter", "xenon"] {
            assert!(trie.contains(word), "{word} must be present");
        }
        assert!(!trie.contains("hel"));
        assert!(!trie.contains("zebra"));
    }

    #[test]
    fn test_prefix_is_ordered_and_bounded() {
        let trie = index();
        assert_eq!(trie.prefix("hel", 10), vec!["helicopter", "hello", "help"]);
        assert_eq!(trie.prefix("hel", 2).len(), 2);
        assert!(trie.prefix("zz", 10).is_empty());
    }

    #[test]
    fn test_build_tolerates_unsorted_duplicates() {
        let trie = TrieIndex::build(&["beta", "alpha", "beta"]).unwrap();
        assert_eq!(trie.len(), 2);
        assert!(trie.contains("alpha"));
    }

    #[test]
    fn test_entity_round_trip() {
        let trie = index();
        let entity = trie.to_entity("c1", "hash1");
        let restored = TrieIndex::from_entity(&entity).unwrap();

        assert_eq!(restored.len(), trie.len());
        assert!(restored.contains("helicopter"));
        assert!(!restored.contains("zebra"));
        assert_eq!(restored.prefix("he", 10), trie.prefix("he", 10));
    }

    #[test]
    fn test_entity_survives_json() {
        // The entity travels through the version manager as a JSON document
        let entity = index().to_entity("c1", "hash1");
        let json = serde_json::to_string(&entity).unwrap();
        let back: TrieIndexEntity = serde_json::from_str(&json).unwrap();
        let restored = TrieIndex::from_entity(&back).unwrap();
        assert!(restored.contains("xenon"));
    }

    #[test]
    fn test_builds_are_byte_identical() {
        // Persisted entities dedup by content hash, so rebuilding the same
        // vocabulary must produce identical payloads
        let a = index().to_entity("c1", "hash1");
        let b = index().to_entity("c1", "hash1");
        assert_eq!(a.serialized_trie, b.serialized_trie);
        assert_eq!(a.bloom_bits, b.bloom_bits);
        assert_eq!(a.bloom_sip_keys, b.bloom_sip_keys);
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let mut entity = index().to_entity("c1", "hash1");
        entity.serialized_trie = vec![1, 2, 3];
        assert!(TrieIndex::from_entity(&entity).is_err());
    }
}
