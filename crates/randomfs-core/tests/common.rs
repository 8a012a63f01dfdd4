//! Common fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use randomfs_core::{
    BlockHash, ContentStore, EngineConfig, MemoryContentStore, Result, StorageEngine,
};
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine over a fresh in-memory store with default configuration.
pub fn memory_engine() -> StorageEngine<MemoryContentStore> {
    engine_with(EngineConfig::default())
}

/// Engine over a fresh in-memory store.
pub fn engine_with(config: EngineConfig) -> StorageEngine<MemoryContentStore> {
    init_tracing();
    StorageEngine::new(config, Arc::new(MemoryContentStore::new())).unwrap()
}

/// Deterministic pseudo-random bytes.
pub fn sample_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

/// Content store that waits before every call.
pub struct SlowStore {
    inner: MemoryContentStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryContentStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl ContentStore for SlowStore {
    async fn put(&self, data: Bytes) -> Result<BlockHash> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(data).await
    }

    async fn get(&self, hash: &BlockHash) -> Result<Bytes> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(hash).await
    }
}
