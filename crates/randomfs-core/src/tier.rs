//! Block size tiers and fixed-size chunking

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 1 KiB blocks for small files.
pub const NANO_BLOCK_SIZE: usize = 1024;
/// 64 KiB blocks for medium files.
pub const MINI_BLOCK_SIZE: usize = 64 * 1024;
/// 1 MiB blocks for large files.
pub const FULL_BLOCK_SIZE: usize = 1024 * 1024;

/// Block size class chosen once per file from its total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum BlockTier {
    /// 1 KiB
    Nano,
    /// 64 KiB
    Mini,
    /// 1 MiB
    Full,
}

impl BlockTier {
    /// All tiers, smallest first.
    pub const ALL: [BlockTier; 3] = [BlockTier::Nano, BlockTier::Mini, BlockTier::Full];

    /// Block length in bytes.
    pub fn block_size(self) -> usize {
        match self {
            BlockTier::Nano => NANO_BLOCK_SIZE,
            BlockTier::Mini => MINI_BLOCK_SIZE,
            BlockTier::Full => FULL_BLOCK_SIZE,
        }
    }

    /// Tier for an exact block length.
    pub fn from_block_size(size: u64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.block_size() as u64 == size)
    }

    /// Dense index for per-tier arrays.
    pub fn index(self) -> usize {
        match self {
            BlockTier::Nano => 0,
            BlockTier::Mini => 1,
            BlockTier::Full => 2,
        }
    }

    /// Number of blocks needed to hold `file_size` bytes.
    pub fn block_count(self, file_size: u64) -> u64 {
        file_size.div_ceil(self.block_size() as u64)
    }
}

impl From<BlockTier> for u64 {
    fn from(tier: BlockTier) -> u64 {
        tier.block_size() as u64
    }
}

impl TryFrom<u64> for BlockTier {
    type Error = String;

    fn try_from(size: u64) -> Result<Self, Self::Error> {
        BlockTier::from_block_size(size).ok_or_else(|| format!("unsupported block size {size}"))
    }
}

impl std::fmt::Display for BlockTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.block_size())
    }
}

/// File size thresholds for tier selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Files up to this size use [`BlockTier::Nano`]
    pub nano_max_file_size: u64,
    /// Files up to this size use [`BlockTier::Mini`]; larger files use [`BlockTier::Full`]
    pub mini_max_file_size: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            nano_max_file_size: 100 * 1024,
            mini_max_file_size: 10 * 1024 * 1024,
        }
    }
}

impl TierConfig {
    /// Pick the block tier for a file of `file_size` bytes.
    pub fn select(&self, file_size: u64) -> BlockTier {
        if file_size <= self.nano_max_file_size {
            BlockTier::Nano
        } else if file_size <= self.mini_max_file_size {
            BlockTier::Mini
        } else {
            BlockTier::Full
        }
    }
}

/// Split `data` into blocks of exactly `tier.block_size()` bytes, zero-padding the last one.
/// Empty input produces no blocks.
pub fn chunk_padded(data: &[u8], tier: BlockTier) -> Vec<Bytes> {
    let size = tier.block_size();
    data.chunks(size)
        .map(|chunk| {
            if chunk.len() == size {
                Bytes::copy_from_slice(chunk)
            } else {
                let mut padded = vec![0u8; size];
                padded[..chunk.len()].copy_from_slice(chunk);
                Bytes::from(padded)
            }
        })
        .collect()
}

/// Length of the payload carried by block `position` of a `file_size`-byte file.
pub fn payload_len(tier: BlockTier, file_size: u64, position: u64) -> usize {
    let size = tier.block_size() as u64;
    let start = position.saturating_mul(size);
    file_size.saturating_sub(start).min(size) as usize
}
