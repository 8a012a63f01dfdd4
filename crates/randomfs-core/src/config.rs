//! Engine configuration, loadable from TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::BlockCacheConfig;
use crate::error::{RandomFsError, Result};
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::tier::TierConfig;

/// Tunables for a [`crate::engine::StorageEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entries kept by each per-tier mask pool
    pub pool_capacity: usize,
    /// Masks XORed into each block under the masking policies
    pub mask_count: usize,
    /// Blocks processed concurrently while storing
    pub max_concurrency: usize,
    /// Blocks fetched ahead of the reader while retrieving
    pub read_ahead: usize,
    /// Deadline for a whole store or retrieve, in milliseconds
    pub operation_timeout_ms: Option<u64>,
    /// Whether retrievals bump manifest popularity
    pub count_retrievals: bool,
    /// File size thresholds for block tiers
    pub tiers: TierConfig,
    /// Block cache sizing
    pub cache: BlockCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            mask_count: 2,
            max_concurrency: 8,
            read_ahead: 3,
            operation_timeout_ms: None,
            count_retrievals: true,
            tiers: TierConfig::default(),
            cache: BlockCacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| RandomFsError::InvalidConfig(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| RandomFsError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(RandomFsError::InvalidConfig(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(RandomFsError::InvalidConfig(
                "pool_capacity must be at least 1".to_string(),
            ));
        }
        if self.mask_count == 0 {
            return Err(RandomFsError::InvalidConfig(
                "mask_count must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 || self.read_ahead == 0 {
            return Err(RandomFsError::InvalidConfig(
                "max_concurrency and read_ahead must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_ms == Some(0) {
            return Err(RandomFsError::InvalidConfig(
                "operation_timeout_ms must be positive when set".to_string(),
            ));
        }
        if self.tiers.nano_max_file_size > self.tiers.mini_max_file_size {
            return Err(RandomFsError::InvalidConfig(format!(
                "nano_max_file_size ({}) exceeds mini_max_file_size ({})",
                self.tiers.nano_max_file_size, self.tiers.mini_max_file_size
            )));
        }
        self.cache.validate()
    }

    /// Operation deadline, if configured.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}
