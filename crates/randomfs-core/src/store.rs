//! Content store: the durable, content-addressed blob service the engine
//! writes stored blocks, mask blocks and published manifests into.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{RandomFsError, Result};
use crate::fingerprint::{blake3_hash, BlockHash};

/// Content-addressed blob store.
///
/// `put` must return the BLAKE3 hash of the bytes, so identical content always
/// maps to the same key. `get` fails with [`RandomFsError::BlockNotFound`] for
/// permanently absent hashes and [`RandomFsError::ContentStoreUnavailable`]
/// for transient failures.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes, returning their hash.
    async fn put(&self, data: Bytes) -> Result<BlockHash>;

    /// Fetch the bytes stored under `hash`.
    async fn get(&self, hash: &BlockHash) -> Result<Bytes>;

    /// True if `hash` is present.
    async fn contains(&self, hash: &BlockHash) -> Result<bool> {
        match self.get(hash).await {
            Ok(_) => Ok(true),
            Err(RandomFsError::BlockNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory content store. Availability can be toggled to simulate outages.
#[derive(Debug)]
pub struct MemoryContentStore {
    blocks: DashMap<BlockHash, Bytes>,
    available: AtomicBool,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContentStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
            available: AtomicBool::new(true),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Number of distinct blocks held.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if no blocks are held.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop a block, as if it had been garbage collected.
    pub fn remove(&self, hash: &BlockHash) -> Option<Bytes> {
        self.blocks.remove(hash).map(|(_, data)| data)
    }

    /// Make every subsequent call succeed or fail with `ContentStoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `put` calls served.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of `get` calls served.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RandomFsError::ContentStoreUnavailable(
                "memory store offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: Bytes) -> Result<BlockHash> {
        self.check_available()?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        let hash = blake3_hash(&data);
        self.blocks.entry(hash).or_insert(data);
        Ok(hash)
    }

    async fn get(&self, hash: &BlockHash) -> Result<Bytes> {
        self.check_available()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .get(hash)
            .map(|entry| entry.value().clone())
            .ok_or(RandomFsError::BlockNotFound { hash: *hash })
    }

    async fn contains(&self, hash: &BlockHash) -> Result<bool> {
        self.check_available()?;
        Ok(self.blocks.contains_key(hash))
    }
}

/// Directory-backed content store laid out as `root/xx/yyyy...` by hex hash.
/// Blocks are write-once: an existing file is never rewritten.
#[derive(Debug, Clone)]
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hash_to_path(&self, hash: &BlockHash) -> PathBuf {
        let hex = hash.to_hex();
        let (prefix, suffix) = hex.split_at(2);
        self.root.join(prefix).join(suffix)
    }
}

/// Write through a temp file and rename so readers never see a partial block.
/// The temp file is removed if either step fails.
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
    let written = match tokio::fs::write(&tmp, data).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp block file");
            }
        }
        return Err(e);
    }
    Ok(())
}

fn unavailable(e: std::io::Error) -> RandomFsError {
    RandomFsError::ContentStoreUnavailable(e.to_string())
}

#[async_trait]
impl ContentStore for DirContentStore {
    async fn put(&self, data: Bytes) -> Result<BlockHash> {
        let hash = blake3_hash(&data);
        let path = self.hash_to_path(&hash);
        if tokio::fs::try_exists(&path).await.map_err(unavailable)? {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
        }
        write_atomic(&path, &data).await.map_err(unavailable)?;
        debug!(hash = %hash.short(), bytes = data.len(), "wrote block file");
        Ok(hash)
    }

    async fn get(&self, hash: &BlockHash) -> Result<Bytes> {
        let path = self.hash_to_path(hash);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                if blake3_hash(&data) != *hash {
                    return Err(RandomFsError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("block file {} does not match its hash", path.display()),
                    )));
                }
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RandomFsError::BlockNotFound { hash: *hash })
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn contains(&self, hash: &BlockHash) -> Result<bool> {
        tokio::fs::try_exists(self.hash_to_path(hash))
            .await
            .map_err(unavailable)
    }
}
