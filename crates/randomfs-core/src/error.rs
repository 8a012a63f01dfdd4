//! Error types for the randomfs-core engine

use crate::fingerprint::BlockHash;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, RandomFsError>;

/// All errors that can occur while storing or retrieving randomized blocks
#[derive(Debug, thiserror::Error)]
pub enum RandomFsError {
    /// Block is permanently absent from the content store
    #[error("Block not found: {hash}")]
    BlockNotFound {
        /// Hash that the content store could not resolve
        hash: BlockHash,
    },
    /// Transient content store failure; callers may retry
    #[error("Content store unavailable: {0}")]
    ContentStoreUnavailable(String),
    /// Mask pool holds fewer distinct candidates than requested
    #[error("Mask pool underflow: requested {requested}, available {available}")]
    PoolUnderflow {
        /// Number of distinct masks requested
        requested: usize,
        /// Number of entries currently in the pool
        available: usize,
    },
    /// Manifest failed to deserialize or is structurally inconsistent
    #[error("Corrupt manifest: {0}")]
    CorruptManifest(String),
    /// No manifest is registered under this file id
    #[error("Manifest not found for file {file_id}")]
    ManifestNotFound {
        /// The file id that was looked up
        file_id: BlockHash,
    },
    /// File was stored with deterministic encryption but no password was given
    #[error("Missing password: file was stored with deterministic encryption")]
    MissingPassword,
    /// Malformed rd:// URL
    #[error("Invalid rd:// URL: {0}")]
    InvalidUrl(String),
    /// Configuration rejected by validation or failed to parse
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Operation exceeded the configured deadline
    #[error("Operation timed out after {after_ms} ms")]
    Timeout {
        /// Deadline that was exceeded, in milliseconds
        after_ms: u64,
    },
    /// A single block failed and aborted the whole file operation
    #[error("Block {position} failed: {source}")]
    BlockFailed {
        /// Position of the failing block within the file
        position: u64,
        /// Underlying cause
        #[source]
        source: Box<RandomFsError>,
    },
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RandomFsError {
    /// Wrap an error with the position of the block that produced it.
    pub fn at_block(self, position: u64) -> Self {
        match self {
            already @ RandomFsError::BlockFailed { .. } => already,
            other => RandomFsError::BlockFailed {
                position,
                source: Box::new(other),
            },
        }
    }

    /// True for failures a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RandomFsError::ContentStoreUnavailable(_) | RandomFsError::Timeout { .. } => true,
            RandomFsError::BlockFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
