//! In-memory LRU cache tier
//!
//! One `MemoryCache` per namespace. Entries carry an optional per-entry TTL
//! enforced on read (an expired entry counts as a miss and is dropped).
//! Capacity is a hard bound: inserting into a full cache evicts the least
//! recently used entry. Eviction drops entries from memory only; the disk
//! tier is untouched.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

struct MemoryEntry {
    value: Arc<Value>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Immutable snapshot of memory-tier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Reads served from memory
    pub hits: u64,
    /// Reads that fell through (absent or expired)
    pub misses: u64,
    /// Entries dropped to make room
    pub evictions: u64,
    /// Entries currently resident
    pub entries: usize,
}

/// Bounded per-namespace LRU cache.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Create a cache bounded to `limit` entries (minimum 1).
    pub fn new(limit: usize) -> Self {
        let cap = NonZeroUsize::new(limit.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a key, updating recency. Expired entries are removed and
    /// reported as misses.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                let value = Arc::clone(&entry.value);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(_) => {
                entries.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value, evicting the least recently used entry when full.
    pub fn set(&self, key: &str, value: Arc<Value>, ttl: Option<Duration>) {
        let entry = MemoryEntry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        let mut entries = self.entries.lock();
        if let Some((evicted_key, _)) = entries.push(key.to_string(), entry) {
            // push returns the displaced pair: either the old value under the
            // same key (a replacement) or the LRU victim (an eviction).
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove a key. No-op when absent.
    pub fn remove(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of resident entries (including not-yet-reaped expired ones).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn val(n: i64) -> Arc<Value> {
        Arc::new(json!({ "n": n }))
    }

    #[test]
    fn test_get_set_and_stats() {
        let cache = MemoryCache::new(4);
        cache.set("a", val(1), None);

        assert_eq!(cache.get("a").unwrap().as_ref(), &json!({"n": 1}));
        assert!(cache.get("b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_capacity_bound_and_lru_eviction() {
        let cache = MemoryCache::new(2);
        cache.set("a", val(1), None);
        cache.set("b", val(2), None);

        // Touch "a" so "b" becomes the LRU victim
        cache.get("a");
        cache.set("c", val(3), None);

        assert!(cache.len() <= 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replacement_is_not_an_eviction() {
        let cache = MemoryCache::new(2);
        cache.set("a", val(1), None);
        cache.set("a", val(2), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a").unwrap().as_ref(), &json!({"n": 2}));
    }

    #[test]
    fn test_ttl_expiry_on_read() {
        let cache = MemoryCache::new(4);
        cache.set("a", val(1), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.len(), 0);
    }
}
