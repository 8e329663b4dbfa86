//! Two-tier cache manager
//!
//! Composes the memory tier and the disk tier per namespace:
//! - `get`: memory first; on miss, disk; disk hits are promoted into memory
//! - `set`: canonical-JSON serialize, compress per namespace policy, write
//!   both tiers
//! - `delete`/`clear`: both tiers
//!
//! A disk read error degrades to a cache miss and is logged; a disk write
//! error surfaces to the caller. Concurrent writers to the same key are
//! serialized through a per-key guard; writers to disjoint keys do not block
//! each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::canonical::{canonical_json_bytes, canonicalize};

use super::memory::{MemoryCache, MemoryStats};
use super::{codec, CacheConfig, CacheError, DiskCache, Namespace, Result};

/// Immutable snapshot of cache counters for one namespace (or the sum over
/// all of them).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStatsSnapshot {
    /// Memory-tier hits
    pub memory_hits: u64,
    /// Memory-tier misses
    pub memory_misses: u64,
    /// Memory-tier evictions
    pub memory_evictions: u64,
    /// Entries resident in memory
    pub memory_entries: usize,
    /// Disk-tier hits (each one is also a promotion)
    pub disk_hits: u64,
    /// Full misses (absent from both tiers)
    pub disk_misses: u64,
    /// Successful writes
    pub writes: u64,
    /// Entries resident on disk
    pub disk_entries: u64,
}

impl CacheStatsSnapshot {
    fn absorb(&mut self, memory: MemoryStats, disk: &TierCounters, disk_entries: u64) {
        self.memory_hits += memory.hits;
        self.memory_misses += memory.misses;
        self.memory_evictions += memory.evictions;
        self.memory_entries += memory.entries;
        self.disk_hits += disk.disk_hits.load(std::sync::atomic::Ordering::Relaxed);
        self.disk_misses += disk.disk_misses.load(std::sync::atomic::Ordering::Relaxed);
        self.writes += disk.writes.load(std::sync::atomic::Ordering::Relaxed);
        self.disk_entries += disk_entries;
    }
}

#[derive(Default)]
struct TierCounters {
    disk_hits: std::sync::atomic::AtomicU64,
    disk_misses: std::sync::atomic::AtomicU64,
    writes: std::sync::atomic::AtomicU64,
}

/// Two-tier namespace-partitioned cache manager.
pub struct CacheManager {
    memory: HashMap<Namespace, MemoryCache>,
    disk: Arc<DiskCache>,
    counters: HashMap<Namespace, TierCounters>,
    config: CacheConfig,
    write_guards: DashMap<(Namespace, String), Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl CacheManager {
    /// Open the cache stack and start the background TTL reaper.
    pub fn open(config: CacheConfig) -> Result<Arc<Self>> {
        let disk = Arc::new(DiskCache::open(&config.directory, config.max_disk_bytes)?);

        let mut memory = HashMap::new();
        let mut counters = HashMap::new();
        for ns in Namespace::ALL {
            memory.insert(ns, MemoryCache::new(config.namespace(ns).memory_limit));
            counters.insert(ns, TierCounters::default());
        }

        let manager = Arc::new(Self {
            memory,
            disk,
            counters,
            config,
            write_guards: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        manager.spawn_reaper();
        Ok(manager)
    }

    fn spawn_reaper(self: &Arc<Self>) {
        // Without a runtime (sync construction in tools/tests) TTLs are
        // still enforced lazily on read; only the background sweep is lost.
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!("no tokio runtime, disk cache reaper not started");
            return;
        }
        let disk = Arc::clone(&self.disk);
        let interval = self.config.reaper_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let disk = Arc::clone(&disk);
                        let result = tokio::task::spawn_blocking(move || {
                            disk.reap_expired().and_then(|_| disk.enforce_cap())
                        })
                        .await;
                        if let Ok(Err(e)) = result {
                            tracing::warn!(error = %e, "disk cache reaper pass failed");
                        }
                    }
                }
            }
        });
    }

    /// Stop the background reaper. Pending cache data is flushed.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.disk.flush()
    }

    fn mem(&self, ns: Namespace) -> &MemoryCache {
        &self.memory[&ns]
    }

    fn tier(&self, ns: Namespace) -> &TierCounters {
        &self.counters[&ns]
    }

    /// Get a value. Disk hits are promoted into the memory tier.
    pub async fn get(&self, ns: Namespace, key: &str) -> Option<Arc<Value>> {
        if let Some(value) = self.mem(ns).get(key) {
            return Some(value);
        }

        let framed = match self.disk.get(ns, key) {
            Ok(Some(framed)) => framed,
            Ok(None) => {
                self.tier(ns)
                    .disk_misses
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                // Degrade to a miss; the disk tier is a cache, not a source of truth.
                tracing::warn!(namespace = %ns, key, error = %e, "disk cache read failed");
                self.tier(ns)
                    .disk_misses
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return None;
            }
        };

        let value = match codec::decompress(&framed)
            .map_err(CacheError::from)
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(CacheError::from))
        {
            Ok(value) => Arc::new(value),
            Err(e) => {
                tracing::warn!(namespace = %ns, key, error = %e, "corrupt disk cache entry, dropping");
                let _ = self.disk.delete(ns, key);
                self.tier(ns)
                    .disk_misses
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return None;
            }
        };

        self.tier(ns)
            .disk_hits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.mem(ns)
            .set(key, Arc::clone(&value), self.config.namespace(ns).memory_ttl);
        Some(value)
    }

    /// Set a value in both tiers.
    ///
    /// `ttl` overrides the namespace disk TTL for this entry.
    pub async fn set(
        &self,
        ns: Namespace,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ns_config = self.config.namespace(ns);
        let canonical = canonicalize(value);
        let bytes = canonical_json_bytes(&canonical)?;
        let framed = codec::compress(&bytes, ns_config.compression, &self.config.codec)?;

        let guard = self.write_guard(ns, key);
        let _held = guard.lock().await;

        self.disk
            .set(ns, key, &framed, ttl.or(ns_config.disk_ttl))?;
        self.mem(ns)
            .set(key, Arc::new(canonical), ns_config.memory_ttl);

        self.tier(ns)
            .writes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Set a value whose disk copy never expires.
    ///
    /// Used for external content blobs referenced by versioned records: the
    /// record owns the blob's lifetime, so the namespace TTL must not apply.
    pub async fn set_pinned(&self, ns: Namespace, key: &str, value: &Value) -> Result<()> {
        let ns_config = self.config.namespace(ns);
        let canonical = canonicalize(value);
        let bytes = canonical_json_bytes(&canonical)?;
        let framed = codec::compress(&bytes, ns_config.compression, &self.config.codec)?;

        let guard = self.write_guard(ns, key);
        let _held = guard.lock().await;

        self.disk.set(ns, key, &framed, None)?;
        self.mem(ns)
            .set(key, Arc::new(canonical), ns_config.memory_ttl);

        self.tier(ns)
            .writes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Remove a key from both tiers.
    pub async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let guard = self.write_guard(ns, key);
        let _held = guard.lock().await;

        self.mem(ns).remove(key);
        self.disk.delete(ns, key)?;
        Ok(())
    }

    /// Clear one namespace, or all of them.
    pub async fn clear(&self, ns: Option<Namespace>) -> Result<()> {
        match ns {
            Some(ns) => {
                self.mem(ns).clear();
                self.disk.clear(ns)?;
            }
            None => {
                for ns in Namespace::ALL {
                    self.mem(ns).clear();
                }
                self.disk.clear_all()?;
            }
        }
        self.write_guards.clear();
        Ok(())
    }

    /// Promote a batch of disk entries into memory (bulk warmup).
    pub async fn warm(&self, ns: Namespace, keys: &[String]) -> usize {
        let mut promoted = 0;
        for key in keys {
            if self.mem(ns).get(key).is_some() {
                continue;
            }
            if self.get(ns, key).await.is_some() {
                promoted += 1;
            }
        }
        promoted
    }

    /// Counter snapshot for one namespace, or the aggregate over all.
    pub fn stats(&self, ns: Option<Namespace>) -> CacheStatsSnapshot {
        let mut snapshot = CacheStatsSnapshot::default();
        let targets: Vec<Namespace> = match ns {
            Some(ns) => vec![ns],
            None => Namespace::ALL.to_vec(),
        };
        for ns in targets {
            let disk_entries = self.disk.entry_count(ns).unwrap_or(0);
            snapshot.absorb(self.mem(ns).stats(), self.tier(ns), disk_entries);
        }
        snapshot
    }

    /// The underlying disk tier (shared with the cold-store reaper tests).
    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// The configuration this manager was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn write_guard(&self, ns: Namespace, key: &str) -> Arc<Mutex<()>> {
        // Idle guards (no holder, no waiter) are pruned periodically so the
        // table does not grow with every key ever written.
        if self.write_guards.len() > 4096 {
            self.write_guards
                .retain(|_, guard| Arc::strong_count(guard) > 1 || guard.try_lock().is_err());
        }
        self.write_guards
            .entry((ns, key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
