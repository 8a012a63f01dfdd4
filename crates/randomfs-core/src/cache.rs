//! LRU block cache for recently used stored and mask blocks.
//!
//! Readers share a read lock and record recency with an atomic tick; inserts
//! and eviction take the write lock. Cached data is refcounted [`Bytes`], so
//! evicting an entry never invalidates a copy a reader already holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RandomFsError, Result};
use crate::fingerprint::BlockHash;

/// Statistics tracking for the block cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries inserted.
    pub insertions: u64,
    /// Number of entries evicted.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate as a ratio of hits to total accesses.
    ///
    /// Returns 0.0 if there have been no cache accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Configuration for the block cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Maximum bytes of block data held (default 100MB).
    pub capacity_bytes: u64,
    /// Fill ratio eviction shrinks the cache to once capacity is exceeded (default 0.75).
    pub target_fill_ratio: f64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 100 * 1024 * 1024, // 100MB
            target_fill_ratio: 0.75,
        }
    }
}

impl BlockCacheConfig {
    /// Reject ratios outside (0, 1].
    pub fn validate(&self) -> Result<()> {
        if !(self.target_fill_ratio > 0.0 && self.target_fill_ratio <= 1.0) {
            return Err(RandomFsError::InvalidConfig(format!(
                "cache target_fill_ratio must be in (0, 1], got {}",
                self.target_fill_ratio
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: Bytes,
    last_access: AtomicU64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<BlockHash, CacheEntry>,
    memory_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

/// Bounded, thread-safe LRU cache of block bytes keyed by hash.
#[derive(Debug)]
pub struct BlockCache {
    config: BlockCacheConfig,
    state: RwLock<CacheState>,
    clock: AtomicU64,
    counters: Counters,
}

impl BlockCache {
    /// Creates a new block cache with the given configuration.
    pub fn new(config: BlockCacheConfig) -> Self {
        debug!(
            capacity_bytes = config.capacity_bytes,
            target_fill_ratio = config.target_fill_ratio,
            "created new block cache"
        );
        Self {
            config,
            state: RwLock::new(CacheState::default()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a block, refreshing its recency on a hit.
    pub fn get(&self, hash: &BlockHash) -> Option<Bytes> {
        let state = self.state.read();
        match state.entries.get(hash) {
            Some(entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// True if the block is cached. Does not touch recency or hit counters.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.state.read().entries.contains_key(hash)
    }

    /// Insert or refresh a block, evicting least recently used entries when
    /// capacity is exceeded. Blocks larger than the whole capacity are not cached.
    pub fn put(&self, hash: BlockHash, data: Bytes) {
        let size = data.len() as u64;
        if size > self.config.capacity_bytes {
            debug!(hash = %hash.short(), size, "block larger than cache capacity, not cached");
            return;
        }
        let tick = self.tick();
        let mut state = self.state.write();
        if let Some(old) = state.entries.insert(
            hash,
            CacheEntry {
                data,
                last_access: AtomicU64::new(tick),
            },
        ) {
            state.memory_bytes -= old.data.len() as u64;
        }
        state.memory_bytes += size;
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);

        if state.memory_bytes > self.config.capacity_bytes {
            self.evict_lru(&mut state);
        }
    }

    fn evict_lru(&self, state: &mut CacheState) {
        let target = (self.config.capacity_bytes as f64 * self.config.target_fill_ratio) as u64;
        let mut by_age: Vec<(u64, BlockHash)> = state
            .entries
            .iter()
            .map(|(h, e)| (e.last_access.load(Ordering::Relaxed), *h))
            .collect();
        by_age.sort_unstable();

        let mut evicted = 0u64;
        for (_, hash) in by_age {
            if state.memory_bytes <= target {
                break;
            }
            if let Some(entry) = state.entries.remove(&hash) {
                state.memory_bytes -= entry.data.len() as u64;
                evicted += 1;
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(
            evicted,
            memory_bytes = state.memory_bytes,
            target,
            "evicted least recently used blocks"
        );
    }

    /// Remove a block from the cache.
    pub fn remove(&self, hash: &BlockHash) -> Option<Bytes> {
        let mut state = self.state.write();
        let entry = state.entries.remove(hash)?;
        state.memory_bytes -= entry.data.len() as u64;
        Some(entry.data)
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Returns the bytes of block data currently held.
    pub fn memory_usage(&self) -> u64 {
        self.state.read().memory_bytes
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.config.capacity_bytes
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Clears all entries from the cache.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.memory_bytes = 0;
        debug!("cleared block cache");
    }
}
