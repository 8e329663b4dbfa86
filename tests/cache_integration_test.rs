//! Integration tests for the cache stack
//!
//! Two-tier round trips, namespace bounds, and the algebraic laws of the
//! codec and canonical serializer (property-tested).

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use lexarc::cache::{
    codec, CacheConfig, CacheManager, CompressionAlgorithm, Namespace, NamespaceConfig,
};
use lexarc::core::{canonical_json_bytes, content_hash};

fn manager_with(dir: &TempDir, config: CacheConfig) -> Arc<CacheManager> {
    CacheManager::open(CacheConfig {
        directory: dir.path().to_path_buf(),
        ..config
    })
    .unwrap()
}

#[tokio::test]
async fn test_two_tier_round_trip_with_compression() {
    let dir = TempDir::new().unwrap();
    let cache = manager_with(&dir, CacheConfig::default());

    // Corpus namespace compresses with zstd
    let vocab: Vec<String> = (0..2000).map(|i| format!("word-{i}")).collect();
    let value = json!({ "vocab": vocab });

    cache.set(Namespace::Corpus, "big", &value, None).await.unwrap();
    let from_memory = cache.get(Namespace::Corpus, "big").await.unwrap();
    assert_eq!(from_memory.as_ref(), &value);

    // Drop memory, force the disk + decompress path
    cache.clear(Some(Namespace::Corpus)).await.unwrap();
    cache.set(Namespace::Corpus, "big", &value, None).await.unwrap();
    let stats_before = cache.stats(Some(Namespace::Corpus));

    // A fresh manager over the same directory reads through disk only.
    // Stop the reaper first so the sled handle is released.
    cache.shutdown().unwrap();
    drop(cache);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let cache = manager_with(&dir, CacheConfig::default());
    let from_disk = cache.get(Namespace::Corpus, "big").await.unwrap();
    assert_eq!(from_disk.as_ref(), &value);
    assert!(stats_before.writes >= 1);
}

#[tokio::test]
async fn test_memory_limit_invariant_per_namespace() {
    let dir = TempDir::new().unwrap();
    let mut config = CacheConfig::default();
    config.namespaces.insert(
        Namespace::Default,
        NamespaceConfig {
            memory_limit: 5,
            ..NamespaceConfig::default()
        },
    );
    let cache = manager_with(&dir, config);

    for i in 0..50 {
        cache
            .set(Namespace::Default, &format!("k{i}"), &json!(i), None)
            .await
            .unwrap();
        // The invariant holds at every step, not just at the end
        assert!(cache.stats(Some(Namespace::Default)).memory_entries <= 5);
    }

    // Evicted entries are still served from disk
    let value = cache.get(Namespace::Default, "k0").await.unwrap();
    assert_eq!(value.as_ref(), &json!(0));
}

#[tokio::test]
async fn test_delete_and_clear_span_both_tiers() {
    let dir = TempDir::new().unwrap();
    let cache = manager_with(&dir, CacheConfig::default());

    cache.set(Namespace::Search, "a", &json!(1), None).await.unwrap();
    cache.set(Namespace::Search, "b", &json!(2), None).await.unwrap();

    cache.delete(Namespace::Search, "a").await.unwrap();
    assert!(cache.get(Namespace::Search, "a").await.is_none());

    cache.clear(None).await.unwrap();
    assert!(cache.get(Namespace::Search, "b").await.is_none());
}

#[tokio::test]
async fn test_stats_report_hits_and_misses() {
    let dir = TempDir::new().unwrap();
    let cache = manager_with(&dir, CacheConfig::default());

    cache.set(Namespace::Trie, "k", &json!({"v": 1}), None).await.unwrap();
    let _ = cache.get(Namespace::Trie, "k").await; // memory hit
    let _ = cache.get(Namespace::Trie, "absent").await; // full miss

    let stats = cache.stats(Some(Namespace::Trie));
    assert_eq!(stats.memory_hits, 1);
    assert!(stats.disk_misses >= 1);
    assert_eq!(stats.writes, 1);
}

proptest! {
    #[test]
    fn prop_codec_round_trips_all_algorithms(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let config = codec::CodecConfig::default();
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Gzip,
        ] {
            let framed = codec::compress(&data, algo, &config).unwrap();
            prop_assert_eq!(codec::decompress(&framed).unwrap(), data.clone());
        }
    }

    #[test]
    fn prop_canonical_bytes_are_deterministic(
        keys in proptest::collection::btree_set("[a-z]{1,8}", 1..8),
        numbers in proptest::collection::vec(any::<i64>(), 1..8),
    ) {
        // Build the same logical object twice with reversed insertion order
        let pairs: Vec<(String, i64)> = keys
            .iter()
            .cloned()
            .zip(numbers.iter().copied().cycle())
            .collect();

        let mut forward = serde_json::Map::new();
        for (k, v) in &pairs {
            forward.insert(k.clone(), json!(v));
        }
        let mut backward = serde_json::Map::new();
        for (k, v) in pairs.iter().rev() {
            backward.insert(k.clone(), json!(v));
        }

        let a = serde_json::Value::Object(forward);
        let b = serde_json::Value::Object(backward);
        prop_assert_eq!(canonical_json_bytes(&a).unwrap(), canonical_json_bytes(&b).unwrap());
        prop_assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}
