//! Content fingerprinting: BLAKE3 block hashes

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

/// A 32-byte BLAKE3 hash identifying a block's content. The only lookup key
/// used by the pool, cache, registry and content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(BlockHash(bytes))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(BlockHash(bytes))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> BlockHash {
    BlockHash(*blake3::hash(data).as_bytes())
}

/// Keyed BLAKE3 hash, used for password-bound file ids
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> BlockHash {
    BlockHash(*blake3::keyed_hash(key, data).as_bytes())
}

/// Interpret the first 8 bytes of a hash as a little-endian integer
pub fn hash_to_u64(hash: &BlockHash) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash.0[..8]);
    u64::from_le_bytes(buf)
}
