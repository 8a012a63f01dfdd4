//! Top-K mask pool: the bounded set of most reused mask candidates.
//!
//! Every stored block and every mask use is reported through [`MaskPool::touch`].
//! The pool keeps the K hashes with the highest popularity; a candidate
//! outside the pool replaces the weakest member once its count exceeds it.
//! Weakest means lowest popularity, then oldest insertion.
//!
//! Counts for non-members are kept in a bounded shadow table. When it
//! overflows, the least popular half is forgotten.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RandomFsError, Result};
use crate::fingerprint::BlockHash;

/// Default number of entries held by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// Non-member counts tracked per pool slot before pruning.
const SHADOW_FACTOR: usize = 8;
/// Floor on the shadow table size for small pools.
const MIN_SHADOW_LIMIT: usize = 64;

/// A pool member and its popularity count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskPoolEntry {
    /// Hash of the candidate mask block
    pub hash: BlockHash,
    /// Number of times the block was stored or used as a mask
    pub popularity: u64,
}

#[derive(Debug, Clone, Copy)]
struct Member {
    popularity: u64,
    seq: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    members: HashMap<BlockHash, Member>,
    // popularity for members and recently seen candidates
    counts: HashMap<BlockHash, u64>,
    next_seq: u64,
}

impl PoolState {
    fn weakest(&self) -> Option<(BlockHash, Member)> {
        self.members
            .iter()
            .min_by_key(|(_, m)| (m.popularity, m.seq))
            .map(|(h, m)| (*h, *m))
    }

    fn admit(&mut self, hash: BlockHash, popularity: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(hash, Member { popularity, seq });
    }

    /// Drop the least popular non-member counts once more than `limit` exist,
    /// keeping the top `limit / 2`.
    fn prune_shadow(&mut self, limit: usize) {
        if self.counts.len() <= self.members.len() + limit {
            return;
        }
        let mut shadow: Vec<(BlockHash, u64)> = self
            .counts
            .iter()
            .filter(|(h, _)| !self.members.contains_key(*h))
            .map(|(h, c)| (*h, *c))
            .collect();
        let keep = limit / 2;
        if shadow.len() <= keep {
            return;
        }
        shadow.select_nth_unstable_by(keep, |a, b| b.1.cmp(&a.1));
        let dropped = shadow.len() - keep;
        for (hash, _) in &shadow[keep..] {
            self.counts.remove(hash);
        }
        debug!(dropped, kept = keep, "pruned mask pool shadow counts");
    }
}

/// Bounded, thread-safe registry of popular mask candidates.
#[derive(Debug)]
pub struct MaskPool {
    capacity: usize,
    shadow_limit: usize,
    state: Mutex<PoolState>,
}

impl Default for MaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl MaskPool {
    /// Create an empty pool holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shadow_limit: capacity.saturating_mul(SHADOW_FACTOR).max(MIN_SHADOW_LIMIT),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently in the pool.
    pub fn size(&self) -> usize {
        self.state.lock().members.len()
    }

    /// True if the pool has no entries.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True if `hash` is a current pool member.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.state.lock().members.contains_key(hash)
    }

    /// Popularity recorded for `hash`, whether or not it is a member.
    /// Rarely touched non-members may have been forgotten and report 0.
    pub fn popularity(&self, hash: &BlockHash) -> u64 {
        self.state.lock().counts.get(hash).copied().unwrap_or(0)
    }

    /// Record one use of `hash`. Returns its new popularity.
    pub fn touch(&self, hash: BlockHash) -> u64 {
        self.touch_by(hash, 1)
    }

    /// Record `delta` uses of `hash`. Returns its new popularity.
    pub fn touch_by(&self, hash: BlockHash, delta: u64) -> u64 {
        let mut state = self.state.lock();
        let count = self.record(&mut state, hash, delta);
        state.prune_shadow(self.shadow_limit);
        count
    }

    fn record(&self, state: &mut PoolState, hash: BlockHash, delta: u64) -> u64 {
        let count = {
            let c = state.counts.entry(hash).or_insert(0);
            *c = c.saturating_add(delta);
            *c
        };

        if let Some(member) = state.members.get_mut(&hash) {
            member.popularity = count;
            return count;
        }
        if self.capacity == 0 {
            return count;
        }
        if state.members.len() < self.capacity {
            state.admit(hash, count);
            return count;
        }
        if let Some((weakest, member)) = state.weakest() {
            if count > member.popularity {
                state.members.remove(&weakest);
                state.admit(hash, count);
                debug!(
                    evicted = %weakest.short(),
                    admitted = %hash.short(),
                    popularity = count,
                    "mask pool promotion"
                );
            }
        }
        count
    }

    /// Sample `k` distinct members uniformly with the OS CSPRNG.
    ///
    /// Fails with [`RandomFsError::PoolUnderflow`] if fewer than `k` members exist.
    pub fn select(&self, k: usize) -> Result<Vec<BlockHash>> {
        let state = self.state.lock();
        let available = state.members.len();
        if available < k {
            return Err(RandomFsError::PoolUnderflow {
                requested: k,
                available,
            });
        }
        let hashes: Vec<BlockHash> = state.members.keys().copied().collect();
        drop(state);
        let picked = rand::seq::index::sample(&mut OsRng, hashes.len(), k);
        Ok(picked.into_iter().map(|i| hashes[i]).collect())
    }

    /// Members ordered by popularity descending; ties go to the older entry.
    pub fn ranked(&self) -> Vec<MaskPoolEntry> {
        let state = self.state.lock();
        let mut members: Vec<(BlockHash, Member)> =
            state.members.iter().map(|(h, m)| (*h, *m)).collect();
        drop(state);
        members.sort_by(|(_, a), (_, b)| {
            b.popularity
                .cmp(&a.popularity)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        members
            .into_iter()
            .map(|(hash, m)| MaskPoolEntry {
                hash,
                popularity: m.popularity,
            })
            .collect()
    }

    /// Member at `rank` in [`Self::ranked`] order.
    pub fn entry_at(&self, rank: usize) -> Option<MaskPoolEntry> {
        self.ranked().get(rank).copied()
    }

    /// Number of hashes with a recorded count, members included.
    pub fn tracked(&self) -> usize {
        self.state.lock().counts.len()
    }

    /// Minimum popularity among members, if any.
    pub fn min_popularity(&self) -> Option<u64> {
        self.state.lock().weakest().map(|(_, m)| m.popularity)
    }
}
