//! File manifests: the ordered block list needed to rebuild one file.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{RandomFsError, Result};
use crate::fingerprint::BlockHash;
use crate::tier::BlockTier;

/// Manifest format version written into every manifest and rd:// URL.
pub const PROTOCOL_VERSION: &str = "v4";

/// Ordered mask hashes for one block. Empty means the block is stored as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaskDescriptor(pub Vec<BlockHash>);

impl MaskDescriptor {
    /// True if the stored block is the payload itself.
    pub fn is_unmasked(&self) -> bool {
        self.0.is_empty()
    }

    /// Mask hashes in encode order.
    pub fn hashes(&self) -> &[BlockHash] {
        &self.0
    }
}

/// How to reconstruct one block of the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Block position in the file (0-based)
    pub position: u64,
    /// Hash of the block held by the content store
    pub stored_hash: BlockHash,
    /// Masks XORed into the stored block
    pub masks: MaskDescriptor,
}

/// Transform applied to payloads before masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Payload masked directly
    Plain,
    /// Payload deterministically encrypted with a password-derived keystream
    Deterministic,
}

mod atomic_counter {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::atomic::{AtomicU64, Ordering};

    pub fn serialize<S: Serializer>(value: &AtomicU64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.load(Ordering::Relaxed))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<AtomicU64, D::Error> {
        u64::deserialize(deserializer).map(AtomicU64::new)
    }
}

/// Recipe for rebuilding one file. Immutable after creation apart from
/// `popularity_score`, which concurrent re-stores and reads increment.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileManifest {
    /// Content fingerprint, the registry key
    pub file_id: BlockHash,
    /// Original file name
    pub file_name: String,
    /// Original size in bytes; used to trim padding
    pub file_size: u64,
    /// Block tier used for every block of the file
    pub block_size: BlockTier,
    /// MIME type supplied at store time
    pub content_type: String,
    /// Pre-masking payload transform
    pub encoding: PayloadEncoding,
    /// Manifest format version
    pub version: String,
    /// Block descriptors; index equals position
    pub blocks: Vec<BlockDescriptor>,
    /// Unix timestamp of creation
    pub created_at_secs: u64,
    #[serde(with = "atomic_counter")]
    popularity_score: AtomicU64,
}

impl Clone for FileManifest {
    fn clone(&self) -> Self {
        Self {
            file_id: self.file_id,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            block_size: self.block_size,
            content_type: self.content_type.clone(),
            encoding: self.encoding,
            version: self.version.clone(),
            blocks: self.blocks.clone(),
            created_at_secs: self.created_at_secs,
            popularity_score: AtomicU64::new(self.popularity_score()),
        }
    }
}

impl FileManifest {
    /// Build a manifest with popularity 1 and the current timestamp.
    pub fn new(
        file_id: BlockHash,
        file_name: impl Into<String>,
        file_size: u64,
        block_size: BlockTier,
        content_type: impl Into<String>,
        encoding: PayloadEncoding,
        blocks: Vec<BlockDescriptor>,
    ) -> Self {
        let created_at_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            file_id,
            file_name: file_name.into(),
            file_size,
            block_size,
            content_type: content_type.into(),
            encoding,
            version: PROTOCOL_VERSION.to_string(),
            blocks,
            created_at_secs,
            popularity_score: AtomicU64::new(1),
        }
    }

    /// Current popularity.
    pub fn popularity_score(&self) -> u64 {
        self.popularity_score.load(Ordering::Acquire)
    }

    /// Increment popularity, returning the new value.
    pub fn bump_popularity(&self) -> u64 {
        self.popularity_score.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of blocks in the file.
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Check structural consistency: block count matches size and tier,
    /// and every descriptor sits at its own position.
    pub fn validate(&self) -> Result<()> {
        let expected = self.block_size.block_count(self.file_size);
        if self.block_count() != expected {
            return Err(RandomFsError::CorruptManifest(format!(
                "{} blocks recorded, {} expected for {} bytes at block size {}",
                self.blocks.len(),
                expected,
                self.file_size,
                self.block_size
            )));
        }
        if let Some((idx, desc)) = self
            .blocks
            .iter()
            .enumerate()
            .find(|(idx, d)| d.position != *idx as u64)
        {
            return Err(RandomFsError::CorruptManifest(format!(
                "descriptor at index {idx} claims position {}",
                desc.position
            )));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RandomFsError::CorruptManifest(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: FileManifest =
            serde_json::from_slice(bytes).map_err(|e| RandomFsError::CorruptManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }
}
