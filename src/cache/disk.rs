//! Disk cache tier over sled
//!
//! Persistent, bounded KV store. One sled tree per namespace. Every value is
//! framed with its write stamp, last-access stamp, and optional expiry so
//! that TTL can be enforced lazily on read and in bulk by the background
//! reaper, and so size-capped eviction can pick least-recently-accessed
//! victims.
//!
//! Single-key writes are atomic: sled guarantees the insert is applied as a
//! unit, which stands in for the write-temp-then-rename discipline a plain
//! file backend would need.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{CacheError, Namespace, Result};

/// How many writes between opportunistic size-cap checks.
const CAP_CHECK_EVERY: u64 = 256;

/// Evict down to this fraction of the cap once over it.
const CAP_LOW_WATER: f64 = 0.9;

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    payload: Vec<u8>,
    stored_at_ms: u64,
    last_access_ms: u64,
    expires_at_ms: Option<u64>,
}

impl DiskEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Persistent bounded disk cache.
pub struct DiskCache {
    db: sled::Db,
    max_bytes: u64,
    writes: AtomicU64,
}

impl DiskCache {
    /// Open (or create) the disk cache under `directory`.
    pub fn open(directory: &Path, max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let db = sled::open(directory)?;
        Ok(Self {
            db,
            max_bytes,
            writes: AtomicU64::new(0),
        })
    }

    fn tree(&self, ns: Namespace) -> Result<sled::Tree> {
        Ok(self.db.open_tree(format!("cache_{}", ns.label()))?)
    }

    /// Read a value. Expired entries are removed and reported as absent.
    /// The last-access stamp is refreshed on every hit.
    pub fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(ns)?;
        let Some(raw) = tree.get(key.as_bytes())? else {
            return Ok(None);
        };

        let mut entry: DiskEntry = bincode::deserialize(&raw)?;
        let now = now_ms();
        if entry.is_expired(now) {
            tree.remove(key.as_bytes())?;
            return Ok(None);
        }

        let payload = entry.payload.clone();
        entry.last_access_ms = now;
        // Recency refresh is best-effort; a failed stamp must not fail the read.
        if let Ok(stamped) = bincode::serialize(&entry) {
            let _ = tree.insert(key.as_bytes(), stamped);
        }

        Ok(Some(payload))
    }

    /// Write a value. Observable immediately after return.
    pub fn set(&self, ns: Namespace, key: &str, payload: &[u8], ttl: Option<Duration>) -> Result<()> {
        let now = now_ms();
        let entry = DiskEntry {
            payload: payload.to_vec(),
            stored_at_ms: now,
            last_access_ms: now,
            expires_at_ms: ttl.map(|d| now + d.as_millis() as u64),
        };
        let bytes = bincode::serialize(&entry)?;
        self.tree(ns)?
            .insert(key.as_bytes(), bytes)
            .map_err(|e| CacheError::WriteFailed(format!("{ns}:{key}: {e}")))?;

        if self.writes.fetch_add(1, Ordering::Relaxed) % CAP_CHECK_EVERY == CAP_CHECK_EVERY - 1 {
            self.enforce_cap()?;
        }
        Ok(())
    }

    /// Remove a key. No-op when absent.
    pub fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        self.tree(ns)?.remove(key.as_bytes())?;
        Ok(())
    }

    /// All live (non-expired) entries under `prefix` in a namespace.
    pub fn iter_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = self.tree(ns)?;
        let now = now_ms();
        let mut out = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item?;
            let entry: DiskEntry = bincode::deserialize(&raw)?;
            if entry.is_expired(now) {
                continue;
            }
            out.push((String::from_utf8_lossy(&key).into_owned(), entry.payload));
        }
        Ok(out)
    }

    /// Drop every entry in a namespace.
    pub fn clear(&self, ns: Namespace) -> Result<()> {
        self.tree(ns)?.clear()?;
        Ok(())
    }

    /// Drop every entry in every namespace.
    pub fn clear_all(&self) -> Result<()> {
        for ns in Namespace::ALL {
            self.clear(ns)?;
        }
        Ok(())
    }

    /// Remove expired entries across all namespaces. Returns the number
    /// removed. Called by the background reaper.
    pub fn reap_expired(&self) -> Result<u64> {
        let now = now_ms();
        let mut removed = 0u64;
        for ns in Namespace::ALL {
            let tree = self.tree(ns)?;
            let mut victims = Vec::new();
            for item in tree.iter() {
                let (key, raw) = item?;
                if let Ok(entry) = bincode::deserialize::<DiskEntry>(&raw) {
                    if entry.is_expired(now) {
                        victims.push(key);
                    }
                } else {
                    // Unreadable frame: reap it rather than resurrect it forever
                    victims.push(key);
                }
            }
            for key in victims {
                tree.remove(key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "disk cache reaper removed expired entries");
        }
        Ok(removed)
    }

    /// Evict least-recently-accessed entries until resident payload bytes
    /// fall below the configured cap. Returns the number evicted.
    pub fn enforce_cap(&self) -> Result<u64> {
        let mut total: u64 = 0;
        // (last_access, ns, key, size)
        let mut entries: Vec<(u64, Namespace, sled::IVec, u64)> = Vec::new();
        for ns in Namespace::ALL {
            let tree = self.tree(ns)?;
            for item in tree.iter() {
                let (key, raw) = item?;
                let size = raw.len() as u64;
                total += size;
                let access = bincode::deserialize::<DiskEntry>(&raw)
                    .map(|e| e.last_access_ms)
                    .unwrap_or(0);
                entries.push((access, ns, key, size));
            }
        }

        if total <= self.max_bytes {
            return Ok(0);
        }

        let target = (self.max_bytes as f64 * CAP_LOW_WATER) as u64;
        entries.sort_by_key(|(access, ..)| *access);

        let mut evicted = 0u64;
        for (_, ns, key, size) in entries {
            if total <= target {
                break;
            }
            self.tree(ns)?.remove(key)?;
            total = total.saturating_sub(size);
            evicted += 1;
        }
        tracing::debug!(evicted, total, "disk cache evicted to size cap");
        Ok(evicted)
    }

    /// Number of resident entries in a namespace.
    pub fn entry_count(&self, ns: Namespace) -> Result<u64> {
        Ok(self.tree(ns)?.len() as u64)
    }

    /// Bytes reported by the backing store.
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Flush dirty buffers to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_cache() -> (TempDir, DiskCache) {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), 10 * 1024 * 1024).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_set_get_delete() {
        let (_dir, cache) = open_cache();
        cache.set(Namespace::Default, "k", b"hello", None).unwrap();
        assert_eq!(
            cache.get(Namespace::Default, "k").unwrap().as_deref(),
            Some(&b"hello"[..])
        );

        cache.delete(Namespace::Default, "k").unwrap();
        assert!(cache.get(Namespace::Default, "k").unwrap().is_none());
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let (_dir, cache) = open_cache();
        cache.set(Namespace::Corpus, "k", b"a", None).unwrap();
        assert!(cache.get(Namespace::Trie, "k").unwrap().is_none());
    }

    #[test]
    fn test_ttl_expiry_on_read() {
        let (_dir, cache) = open_cache();
        cache
            .set(Namespace::Default, "k", b"v", Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(Namespace::Default, "k").unwrap().is_none());
    }

    #[test]
    fn test_reaper_removes_expired() {
        let (_dir, cache) = open_cache();
        cache
            .set(Namespace::Default, "dead", b"v", Some(Duration::from_millis(1)))
            .unwrap();
        cache.set(Namespace::Default, "live", b"v", None).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let removed = cache.reap_expired().unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(Namespace::Default, "live").unwrap().is_some());
    }

    #[test]
    fn test_iter_prefix() {
        let (_dir, cache) = open_cache();
        cache.set(Namespace::Default, "ab:1", b"1", None).unwrap();
        cache.set(Namespace::Default, "ab:2", b"2", None).unwrap();
        cache.set(Namespace::Default, "cd:1", b"3", None).unwrap();

        let hits = cache.iter_prefix(Namespace::Default, "ab:").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_size_cap_evicts_lru() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), 4 * 1024).unwrap();

        let blob = vec![7u8; 1024];
        for i in 0..8 {
            cache
                .set(Namespace::Default, &format!("k{i}"), &blob, None)
                .unwrap();
        }
        // Touch k7 so it is the most recently used
        let _ = cache.get(Namespace::Default, "k7").unwrap();

        cache.enforce_cap().unwrap();
        assert!(cache.get(Namespace::Default, "k7").unwrap().is_some());
        assert!(cache.get(Namespace::Default, "k0").unwrap().is_none());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DiskCache::open(dir.path(), 1024 * 1024).unwrap();
            cache.set(Namespace::Default, "k", b"persisted", None).unwrap();
            cache.flush().unwrap();
        }
        let cache = DiskCache::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(
            cache.get(Namespace::Default, "k").unwrap().as_deref(),
            Some(&b"persisted"[..])
        );
    }
}
