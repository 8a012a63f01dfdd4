#![warn(missing_docs)]

//! RandomFS core: privacy-preserving block storage built from XOR-masked blocks
//!
//! Write path: Data → Tier → Chunk (zero-padded) → [Deterministic encrypt] → Select masks (Top-K pool) → XOR → Store
//! Read path:  Manifest → Fetch stored + masks (cache → store) → XOR → [Decrypt] → Trim

pub mod cache;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod store;
pub mod tier;
pub mod url;

pub use cache::{BlockCache, BlockCacheConfig, CacheStats};
pub use config::EngineConfig;
pub use dedup::DedupKey;
pub use engine::{EngineStats, FileStream, PoolStats, StorageEngine, StoreOutcome};
pub use error::{RandomFsError, Result};
pub use fingerprint::BlockHash;
pub use manifest::{BlockDescriptor, FileManifest, MaskDescriptor, PayloadEncoding, PROTOCOL_VERSION};
pub use metrics::{EngineMetric, EngineMetrics, MetricKind, MetricValue};
pub use pool::{MaskPool, MaskPoolEntry, DEFAULT_POOL_CAPACITY};
pub use registry::{ManifestRegistry, Registration};
pub use selector::{
    BlockSelector, DeterministicDedupSelector, MaskPolicy, NaturalPoolSelector, SelectionContext,
    StorePolicy, WeightedDpSelector,
};
pub use store::{ContentStore, DirContentStore, MemoryContentStore};
pub use tier::{BlockTier, TierConfig};
pub use url::RandomUrl;
