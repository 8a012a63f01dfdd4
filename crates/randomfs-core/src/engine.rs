//! Storage engine: chunk, mask, store and register on the way in;
//! fetch, unmask and trim on the way out.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::{BlockCache, CacheStats};
use crate::codec;
use crate::config::EngineConfig;
use crate::dedup::DedupKey;
use crate::error::{RandomFsError, Result};
use crate::fingerprint::{blake3_hash, BlockHash};
use crate::manifest::{BlockDescriptor, FileManifest, MaskDescriptor, PayloadEncoding, PROTOCOL_VERSION};
use crate::metrics::EngineMetrics;
use crate::pool::MaskPool;
use crate::registry::{ManifestRegistry, Registration};
use crate::selector::{BlockSelector, SelectionContext, StorePolicy};
use crate::store::ContentStore;
use crate::tier::{chunk_padded, payload_len, BlockTier};
use crate::url::RandomUrl;

/// Decoded, trimmed blocks of one file in position order.
pub type FileStream<'a> = BoxStream<'a, Result<Bytes>>;

/// Result of [`StorageEngine::store_file`].
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// The registered manifest (possibly one registered earlier)
    pub manifest: Arc<FileManifest>,
    /// Blocks this call wrote to the content store, fresh masks included
    pub new_blocks_stored: u64,
    /// True if the file id was already registered
    pub deduplicated: bool,
}

/// Occupancy of one tier's mask pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Block tier the pool serves
    pub tier: BlockTier,
    /// Current members
    pub size: usize,
    /// Maximum members
    pub capacity: usize,
}

/// Read-only snapshot of engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Registered manifests
    pub manifests: usize,
    /// Files passed to `store_file`
    pub files_stored: u64,
    /// Stores answered by an existing manifest
    pub file_dedup_hits: u64,
    /// Blocks written to the content store
    pub blocks_stored: u64,
    /// Encoded blocks that matched an existing stored block
    pub block_dedup_hits: u64,
    /// Fresh masks generated on pool underflow
    pub fallback_masks: u64,
    /// Retrievals opened
    pub retrievals: u64,
    /// Blocks decoded
    pub blocks_decoded: u64,
    /// Per-tier pool occupancy
    pub pools: Vec<PoolStats>,
    /// Block cache counters
    pub cache: CacheStats,
    /// Bytes held by the block cache
    pub cache_memory_bytes: u64,
}

/// Randomized block storage engine over a [`ContentStore`].
///
/// Owns one mask pool per block tier (masks must match the payload length),
/// the block cache, the manifest registry and the metrics.
#[derive(Debug)]
pub struct StorageEngine<S: ContentStore> {
    config: EngineConfig,
    store: Arc<S>,
    cache: BlockCache,
    pools: [MaskPool; 3],
    registry: ManifestRegistry,
    metrics: EngineMetrics,
}

impl<S: ContentStore> StorageEngine<S> {
    /// Create an engine after validating `config`.
    pub fn new(config: EngineConfig, store: Arc<S>) -> Result<Self> {
        config.validate()?;
        let pools = BlockTier::ALL.map(|_| MaskPool::new(config.pool_capacity));
        info!(
            pool_capacity = config.pool_capacity,
            mask_count = config.mask_count,
            max_concurrency = config.max_concurrency,
            "storage engine ready"
        );
        Ok(Self {
            cache: BlockCache::new(config.cache.clone()),
            config,
            store,
            pools,
            registry: ManifestRegistry::new(),
            metrics: EngineMetrics::new(),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying content store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Mask pool for `tier`.
    pub fn pool(&self, tier: BlockTier) -> &MaskPool {
        &self.pools[tier.index()]
    }

    /// Manifest registry.
    pub fn registry(&self) -> &ManifestRegistry {
        &self.registry
    }

    /// Block cache.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Engine counters.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let result = match self.config.operation_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    let after_ms = limit.as_millis() as u64;
                    warn!(after_ms, "operation timed out");
                    Err(RandomFsError::Timeout { after_ms })
                }
            },
            None => fut.await,
        };
        if result.is_err() {
            self.metrics.record_failure();
        }
        result
    }

    /// Store a file under `policy`.
    ///
    /// A file id already in the registry only bumps popularity and writes
    /// nothing. Any block failure aborts the call before a manifest is registered.
    #[instrument(skip(self, data, policy), fields(size = data.len()))]
    pub async fn store_file(
        &self,
        file_name: &str,
        data: &[u8],
        content_type: &str,
        policy: &StorePolicy,
    ) -> Result<StoreOutcome> {
        self.with_deadline(self.store_inner(file_name, data, content_type, policy))
            .await
    }

    async fn store_inner(
        &self,
        file_name: &str,
        data: &[u8],
        content_type: &str,
        policy: &StorePolicy,
    ) -> Result<StoreOutcome> {
        let selector = policy.build_selector()?;
        let file_size = data.len() as u64;
        let file_id = match selector.dedup_key() {
            Some(key) => key.file_id(data),
            None => blake3_hash(data),
        };

        if let Some(existing) = self.registry.lookup(&file_id) {
            let popularity = existing.bump_popularity();
            self.metrics.record_file_stored(file_size, true);
            info!(file_id = %file_id.short(), popularity, "file already stored");
            return Ok(StoreOutcome {
                manifest: existing,
                new_blocks_stored: 0,
                deduplicated: true,
            });
        }

        let tier = self.config.tiers.select(file_size);
        let encoding = if selector.dedup_key().is_some() {
            PayloadEncoding::Deterministic
        } else {
            PayloadEncoding::Plain
        };
        let selector: &dyn BlockSelector = selector.as_ref();

        let mut stored: Vec<(BlockDescriptor, u64)> =
            stream::iter(chunk_padded(data, tier).into_iter().enumerate())
                .map(move |(idx, payload)| {
                    let position = idx as u64;
                    async move {
                        self.store_block(tier, position, payload, selector)
                            .await
                            .map_err(|e| e.at_block(position))
                    }
                })
                .buffer_unordered(self.config.max_concurrency)
                .try_collect()
                .await?;
        stored.sort_by_key(|(desc, _)| desc.position);

        let new_blocks_stored: u64 = stored.iter().map(|(_, n)| n).sum();
        let blocks = stored.into_iter().map(|(desc, _)| desc).collect();
        let manifest = FileManifest::new(
            file_id,
            file_name,
            file_size,
            tier,
            content_type,
            encoding,
            blocks,
        );

        let (manifest, deduplicated) = match self.registry.register(manifest) {
            Registration::Registered(m) => (m, false),
            Registration::Existing(m) => {
                debug!(file_id = %file_id.short(), "concurrent store registered first");
                (m, true)
            }
        };
        self.metrics.record_file_stored(file_size, deduplicated);
        info!(
            file_id = %file_id.short(),
            tier = %tier,
            blocks = manifest.block_count(),
            new_blocks_stored,
            selector = selector.name(),
            "stored file"
        );
        Ok(StoreOutcome {
            manifest,
            new_blocks_stored,
            deduplicated,
        })
    }

    /// Encode and store one block. Returns its descriptor and the number of
    /// blocks written to the content store.
    async fn store_block(
        &self,
        tier: BlockTier,
        position: u64,
        payload: Bytes,
        selector: &dyn BlockSelector,
    ) -> Result<(BlockDescriptor, u64)> {
        let pool = self.pool(tier);
        let payload = match selector.dedup_key() {
            Some(key) => {
                let mut buf = payload.to_vec();
                key.apply(&mut buf, position);
                Bytes::from(buf)
            }
            None => payload,
        };

        let ctx = SelectionContext {
            fingerprint: blake3_hash(&payload),
            position,
            mask_count: self.config.mask_count,
        };
        let mut written = 0u64;
        let (mask_hashes, masks) = match selector.choose_masks(pool, &ctx) {
            Ok(hashes) => {
                let masks = self.fetch_masks(&hashes).await?;
                (hashes, masks)
            }
            Err(RandomFsError::PoolUnderflow {
                requested,
                available,
            }) => {
                warn!(
                    position,
                    requested, available, "mask pool underflow, generating fresh masks"
                );
                let fresh = self.fresh_masks(tier, requested).await?;
                written += fresh.0.len() as u64;
                fresh
            }
            Err(e) => return Err(e),
        };

        let stored = Bytes::from(codec::encode(&payload, &masks));
        let stored_hash = blake3_hash(&stored);
        let exists = mask_hashes.is_empty()
            && (self.cache.contains(&stored_hash) || self.store.contains(&stored_hash).await?);
        if !exists {
            self.store.put(stored.clone()).await?;
            written += 1;
        }
        self.metrics
            .record_block_encoded(stored.len() as u64, !exists);
        self.cache.put(stored_hash, stored);

        for hash in &mask_hashes {
            pool.touch(*hash);
        }
        pool.touch(stored_hash);

        debug!(
            position,
            stored = %stored_hash.short(),
            masks = mask_hashes.len(),
            reused = exists,
            "stored block"
        );
        Ok((
            BlockDescriptor {
                position,
                stored_hash,
                masks: MaskDescriptor(mask_hashes),
            },
            written,
        ))
    }

    /// Generate `count` high-entropy masks, write them to the store and cache.
    async fn fresh_masks(&self, tier: BlockTier, count: usize) -> Result<(Vec<BlockHash>, Vec<Bytes>)> {
        let mut hashes = Vec::with_capacity(count);
        let mut masks = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buf = vec![0u8; tier.block_size()];
            OsRng.fill_bytes(&mut buf);
            let mask = Bytes::from(buf);
            let hash = self.store.put(mask.clone()).await?;
            self.metrics.record_mask_written(mask.len() as u64);
            self.cache.put(hash, mask.clone());
            hashes.push(hash);
            masks.push(mask);
        }
        self.metrics.record_fallback_masks(count as u64);
        Ok((hashes, masks))
    }

    /// Fetch one block through the cache.
    async fn fetch_block(&self, hash: &BlockHash) -> Result<Bytes> {
        if let Some(data) = self.cache.get(hash) {
            return Ok(data);
        }
        let data = self.store.get(hash).await?;
        self.cache.put(*hash, data.clone());
        Ok(data)
    }

    async fn fetch_masks(&self, hashes: &[BlockHash]) -> Result<Vec<Bytes>> {
        try_join_all(hashes.iter().map(|h| self.fetch_block(h))).await
    }

    async fn decode_block(
        &self,
        manifest: &FileManifest,
        position: u64,
        key: Option<&DedupKey>,
    ) -> Result<Bytes> {
        let desc = manifest
            .blocks
            .get(position as usize)
            .ok_or_else(|| RandomFsError::CorruptManifest(format!("no descriptor for position {position}")))?;
        let block_size = manifest.block_size.block_size();
        let (stored, masks) = futures::try_join!(
            self.fetch_block(&desc.stored_hash),
            self.fetch_masks(desc.masks.hashes())
        )?;
        if let Some(bad) = std::iter::once(&stored)
            .chain(masks.iter())
            .find(|b| b.len() != block_size)
        {
            return Err(RandomFsError::CorruptManifest(format!(
                "block of {} bytes in a file with block size {block_size}",
                bad.len()
            )));
        }

        let mut payload = codec::decode(&stored, &masks);
        if let Some(key) = key {
            key.apply(&mut payload, position);
        }
        payload.truncate(payload_len(manifest.block_size, manifest.file_size, position));
        self.metrics.record_block_decoded(payload.len() as u64);
        Ok(Bytes::from(payload))
    }

    fn open_manifest(
        &self,
        file_id: &BlockHash,
        password: Option<&str>,
    ) -> Result<(Arc<FileManifest>, Option<DedupKey>)> {
        let manifest = self
            .registry
            .lookup(file_id)
            .ok_or(RandomFsError::ManifestNotFound { file_id: *file_id })?;
        let key = match manifest.encoding {
            PayloadEncoding::Plain => None,
            PayloadEncoding::Deterministic => Some(DedupKey::from_password(
                password.ok_or(RandomFsError::MissingPassword)?,
            )),
        };
        Ok((manifest, key))
    }

    /// Stream the blocks of `file_id` from `start_position` onward.
    ///
    /// Blocks are fetched `read_ahead` at a time and yielded in position order.
    /// A start past the last block yields an empty stream.
    #[instrument(skip(self, file_id, password), fields(file_id = %file_id.short()))]
    pub async fn stream_file(
        &self,
        file_id: &BlockHash,
        start_position: u64,
        password: Option<&str>,
    ) -> Result<(Arc<FileManifest>, FileStream<'_>)> {
        self.open_stream(file_id, start_position, password)
            .inspect_err(|_| self.metrics.record_failure())
    }

    fn open_stream(
        &self,
        file_id: &BlockHash,
        start_position: u64,
        password: Option<&str>,
    ) -> Result<(Arc<FileManifest>, FileStream<'_>)> {
        let (manifest, key) = self.open_manifest(file_id, password)?;
        self.metrics.record_retrieval();
        if self.config.count_retrievals {
            manifest.bump_popularity();
        }

        let reader = Arc::clone(&manifest);
        let blocks = stream::iter(start_position..manifest.block_count())
            .map(move |position| {
                let manifest = Arc::clone(&reader);
                let key = key.clone();
                async move {
                    self.decode_block(&manifest, position, key.as_ref())
                        .await
                        .map_err(|e| e.at_block(position))
                }
            })
            .buffered(self.config.read_ahead)
            .boxed();
        Ok((manifest, blocks))
    }

    /// Retrieve `file_id` from `start_position` onward as one buffer.
    ///
    /// Equivalent to concatenating [`Self::stream_file`]; nothing is returned
    /// unless every block decodes.
    #[instrument(skip(self, file_id, password), fields(file_id = %file_id.short()))]
    pub async fn retrieve_file(
        &self,
        file_id: &BlockHash,
        start_position: u64,
        password: Option<&str>,
    ) -> Result<(Bytes, Arc<FileManifest>)> {
        self.with_deadline(async {
            let (manifest, mut blocks) = self.open_stream(file_id, start_position, password)?;
            let mut out = Vec::with_capacity(remaining_len(&manifest, start_position));
            while let Some(block) = blocks.try_next().await? {
                out.extend_from_slice(&block);
            }
            info!(bytes = out.len(), "retrieved file");
            Ok((Bytes::from(out), manifest))
        })
        .await
    }

    /// Write the manifest of `file_id` into the content store and return its `rd://` URL.
    #[instrument(skip(self, file_id), fields(file_id = %file_id.short()))]
    pub async fn publish_manifest(&self, file_id: &BlockHash) -> Result<RandomUrl> {
        let manifest = self
            .registry
            .lookup(file_id)
            .ok_or(RandomFsError::ManifestNotFound { file_id: *file_id })?;
        let json = manifest.to_json()?;
        let manifest_hash = self.store.put(Bytes::from(json)).await?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(manifest.created_at_secs);
        let url = RandomUrl::new(
            manifest.file_name.clone(),
            manifest.file_size,
            timestamp,
            manifest_hash,
        );
        info!(url = %url, "published manifest");
        Ok(url)
    }

    /// Fetch, validate and import the manifest an `rd://` URL points to.
    /// A manifest already registered under the same file id wins.
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn open_url(&self, url: &RandomUrl) -> Result<Arc<FileManifest>> {
        if url.version != PROTOCOL_VERSION {
            return Err(RandomFsError::InvalidUrl(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                url.version
            )));
        }
        let bytes = self.store.get(&url.manifest_hash).await?;
        let manifest = FileManifest::from_json(&bytes)?;
        if manifest.file_size != url.file_size {
            return Err(RandomFsError::CorruptManifest(format!(
                "url claims {} bytes, manifest records {}",
                url.file_size, manifest.file_size
            )));
        }
        let manifest = self.registry.import(manifest);
        debug!(file_id = %manifest.file_id.short(), "imported manifest");
        Ok(manifest)
    }

    /// Snapshot of counters and occupancy.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            manifests: self.registry.len(),
            files_stored: self.metrics.files_stored(),
            file_dedup_hits: self.metrics.file_dedup_hits(),
            blocks_stored: self.metrics.blocks_stored(),
            block_dedup_hits: self.metrics.block_dedup_hits(),
            fallback_masks: self.metrics.fallback_masks(),
            retrievals: self.metrics.retrievals(),
            blocks_decoded: self.metrics.blocks_decoded(),
            pools: BlockTier::ALL
                .iter()
                .map(|tier| {
                    let pool = self.pool(*tier);
                    PoolStats {
                        tier: *tier,
                        size: pool.size(),
                        capacity: pool.capacity(),
                    }
                })
                .collect(),
            cache: self.cache.stats(),
            cache_memory_bytes: self.cache.memory_usage(),
        }
    }
}

/// Bytes a retrieval from block `start_position` onward returns.
fn remaining_len(manifest: &FileManifest, start_position: u64) -> usize {
    let block = manifest.block_size.block_size() as u64;
    manifest
        .file_size
        .saturating_sub(start_position.saturating_mul(block)) as usize
}
