//! End-to-end tests for store, retrieve, stream and publish.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use randomfs_core::{
    BlockTier, DirContentStore, EngineConfig, PayloadEncoding, RandomFsError, RandomUrl,
    StorageEngine, StorePolicy,
};

use common::{engine_with, memory_engine, sample_data, SlowStore};

#[tokio::test]
async fn test_hello_world_round_trip() {
    let engine = memory_engine();
    let out = engine
        .store_file("hello.txt", b"HelloWorld", "text/plain", &StorePolicy::natural_pool())
        .await
        .unwrap();

    let manifest = &out.manifest;
    assert_eq!(manifest.file_size, 10);
    assert_eq!(manifest.block_size, BlockTier::Nano);
    assert_eq!(manifest.content_type, "text/plain");
    assert_eq!(manifest.encoding, PayloadEncoding::Plain);
    assert_eq!(manifest.blocks.len(), 1);
    assert_eq!(manifest.blocks[0].position, 0);
    assert_eq!(manifest.blocks[0].masks.hashes().len(), 2);
    assert!(!out.deduplicated);

    let (data, _) = engine.retrieve_file(&manifest.file_id, 0, None).await.unwrap();
    assert_eq!(&data[..], b"HelloWorld");
}

#[tokio::test]
async fn test_identical_store_is_deduplicated() {
    let engine = memory_engine();
    let data = sample_data(3000, 1);
    let first = engine
        .store_file("a.bin", &data, "application/octet-stream", &StorePolicy::natural_pool())
        .await
        .unwrap();
    assert!(first.new_blocks_stored >= 3);
    let stored_before = engine.store().len();

    let second = engine
        .store_file("b.bin", &data, "application/octet-stream", &StorePolicy::natural_pool())
        .await
        .unwrap();
    assert_eq!(second.new_blocks_stored, 0);
    assert!(second.deduplicated);
    assert!(Arc::ptr_eq(&first.manifest, &second.manifest));
    assert_eq!(second.manifest.popularity_score(), 2);
    assert_eq!(engine.store().len(), stored_before);
    assert_eq!(engine.stats().file_dedup_hits, 1);
}

#[tokio::test]
async fn test_deterministic_dedup_same_password() {
    let engine = memory_engine();
    let policy = StorePolicy::deterministic_dedup("shared-password-123");
    let data = sample_data(5000, 7);

    let first = engine.store_file("f", &data, "text/plain", &policy).await.unwrap();
    assert_eq!(first.new_blocks_stored, 5);
    assert!(first.manifest.blocks.iter().all(|b| b.masks.is_unmasked()));

    let second = engine.store_file("f", &data, "text/plain", &policy).await.unwrap();
    assert_eq!(second.new_blocks_stored, 0);
    assert_eq!(second.manifest.popularity_score(), 2);

    let (back, _) = engine
        .retrieve_file(&first.manifest.file_id, 0, Some("shared-password-123"))
        .await
        .unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn test_deterministic_blocks_shared_across_files() {
    let engine = memory_engine();
    let policy = StorePolicy::deterministic_dedup("pw");
    let mut a = vec![1u8; 1024];
    a.extend_from_slice(&[2u8; 1024]);
    let mut b = vec![1u8; 1024];
    b.extend_from_slice(&[3u8; 1024]);

    let first = engine.store_file("a", &a, "x", &policy).await.unwrap();
    let second = engine.store_file("b", &b, "x", &policy).await.unwrap();

    assert_ne!(first.manifest.file_id, second.manifest.file_id);
    assert_eq!(
        first.manifest.blocks[0].stored_hash,
        second.manifest.blocks[0].stored_hash
    );
    assert_ne!(
        first.manifest.blocks[1].stored_hash,
        second.manifest.blocks[1].stored_hash
    );
    assert_eq!(second.new_blocks_stored, 1);
    assert_eq!(engine.stats().block_dedup_hits, 1);
}

#[tokio::test]
async fn test_different_passwords_do_not_collide() {
    let engine = memory_engine();
    let data = sample_data(1500, 3);
    let a = engine
        .store_file("f", &data, "x", &StorePolicy::deterministic_dedup("alpha"))
        .await
        .unwrap();
    let b = engine
        .store_file("f", &data, "x", &StorePolicy::deterministic_dedup("beta"))
        .await
        .unwrap();
    assert_ne!(a.manifest.file_id, b.manifest.file_id);
    assert_ne!(a.manifest.blocks[0].stored_hash, b.manifest.blocks[0].stored_hash);
    assert_eq!(b.new_blocks_stored, 2);
}

#[tokio::test]
async fn test_deterministic_with_masking_round_trip() {
    let engine = memory_engine();
    let data = sample_data(2500, 9);
    let policy = StorePolicy::deterministic_dedup_masked(
        "pw",
        randomfs_core::MaskPolicy::WeightedDp { epsilon: 1.0 },
    );
    let out = engine.store_file("m", &data, "x", &policy).await.unwrap();
    assert!(out.manifest.blocks.iter().all(|b| b.masks.hashes().len() == 2));
    let (back, _) = engine
        .retrieve_file(&out.manifest.file_id, 0, Some("pw"))
        .await
        .unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn test_stream_matches_retrieve() {
    let engine = memory_engine();
    let data = sample_data(5000, 11);
    let out = engine
        .store_file("s", &data, "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    let id = out.manifest.file_id;

    let (_, stream) = engine.stream_file(&id, 0, None).await.unwrap();
    let blocks: Vec<_> = stream.try_collect().await.unwrap();
    assert_eq!(blocks.len(), 5);
    assert!(blocks[..4].iter().all(|b| b.len() == 1024));
    assert_eq!(blocks[4].len(), 5000 - 4 * 1024);
    let streamed: Vec<u8> = blocks.iter().flat_map(|b| b.iter().copied()).collect();

    let (whole, _) = engine.retrieve_file(&id, 0, None).await.unwrap();
    assert_eq!(streamed, whole.to_vec());
    assert_eq!(streamed, data);

    let (tail, _) = engine.retrieve_file(&id, 2, None).await.unwrap();
    assert_eq!(&tail[..], &data[2048..]);
}

#[tokio::test]
async fn test_start_past_end_is_empty() {
    let engine = memory_engine();
    let out = engine
        .store_file("s", b"short", "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    let (data, _) = engine
        .retrieve_file(&out.manifest.file_id, 5, None)
        .await
        .unwrap();
    assert!(data.is_empty());
}

#[tokio::test]
async fn test_empty_file() {
    let engine = memory_engine();
    let out = engine
        .store_file("empty", b"", "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    assert!(out.manifest.blocks.is_empty());
    assert_eq!(out.new_blocks_stored, 0);
    let (data, _) = engine.retrieve_file(&out.manifest.file_id, 0, None).await.unwrap();
    assert!(data.is_empty());
}

#[tokio::test]
async fn test_weighted_dp_uses_pool_once_populated() {
    let engine = memory_engine();
    for seed in 0..5u8 {
        engine
            .store_file("seed", &sample_data(900, seed), "x", &StorePolicy::natural_pool())
            .await
            .unwrap();
    }
    let fallback_before = engine.stats().fallback_masks;
    let pool_size = engine.pool(BlockTier::Nano).size();
    assert!(pool_size >= 2);

    let data = sample_data(4000, 42);
    let out = engine
        .store_file("dp", &data, "x", &StorePolicy::weighted_dp(0.5))
        .await
        .unwrap();
    assert_eq!(engine.stats().fallback_masks, fallback_before);
    for block in &out.manifest.blocks {
        let masks = block.masks.hashes();
        assert_eq!(masks.len(), 2);
        assert_ne!(masks[0], masks[1]);
    }

    let (back, _) = engine.retrieve_file(&out.manifest.file_id, 0, None).await.unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn test_mini_tier_file() {
    let engine = memory_engine();
    let data = sample_data(200 * 1024, 5);
    let out = engine
        .store_file("mini", &data, "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    assert_eq!(out.manifest.block_size, BlockTier::Mini);
    assert_eq!(out.manifest.blocks.len(), 4);
    assert_eq!(engine.pool(BlockTier::Nano).size(), 0);
    assert!(engine.pool(BlockTier::Mini).size() > 0);

    let (back, _) = engine.retrieve_file(&out.manifest.file_id, 0, None).await.unwrap();
    assert_eq!(back.len(), data.len());
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn test_missing_block_names_position() {
    // sequential store so no block masks another block of this file
    let engine = engine_with(EngineConfig {
        max_concurrency: 1,
        ..EngineConfig::default()
    });
    let out = engine
        .store_file("f", &sample_data(3000, 2), "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    let lost = out.manifest.blocks[1].stored_hash;
    engine.store().remove(&lost);
    engine.cache().clear();

    let err = engine
        .retrieve_file(&out.manifest.file_id, 0, None)
        .await
        .unwrap_err();
    match err {
        RandomFsError::BlockFailed { position, source } => {
            assert_eq!(position, 1);
            assert!(matches!(*source, RandomFsError::BlockNotFound { hash } if hash == lost));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_unavailable_store_registers_nothing() {
    let engine = memory_engine();
    engine.store().set_available(false);
    let err = engine
        .store_file("f", b"payload", "x", &StorePolicy::natural_pool())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, RandomFsError::BlockFailed { position: 0, .. }));
    assert!(engine.registry().is_empty());
    assert_eq!(engine.metrics().failed_operations(), 1);

    engine.store().set_available(true);
    let out = engine
        .store_file("f", b"payload", "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    assert!(!out.deduplicated);
    assert_eq!(engine.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stores_of_same_file() {
    let engine = Arc::new(memory_engine());
    let data = Arc::new(sample_data(4096, 77));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let data = Arc::clone(&data);
            tokio::spawn(async move {
                engine
                    .store_file("same", &data, "x", &StorePolicy::natural_pool())
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().manifest.file_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.registry().len(), 1);
    let manifest = engine.registry().lookup(&ids[0]).unwrap();
    assert_eq!(manifest.popularity_score(), 8);
    // every store but the first is a dedup hit, whether it lost the race or not
    assert_eq!(engine.metrics().files_stored(), 8);
    assert_eq!(engine.metrics().file_dedup_hits(), 7);

    let (back, _) = engine.retrieve_file(&ids[0], 0, None).await.unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_files() {
    let engine = Arc::new(memory_engine());
    let handles: Vec<_> = (0..16u8)
        .map(|seed| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let data = sample_data(1000 + seed as usize * 300, seed);
                let out = engine
                    .store_file("f", &data, "x", &StorePolicy::natural_pool())
                    .await?;
                let (back, _) = engine.retrieve_file(&out.manifest.file_id, 0, None).await?;
                Ok::<_, RandomFsError>(back.to_vec() == data)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }
    assert_eq!(engine.registry().len(), 16);
    assert!(engine.pool(BlockTier::Nano).size() <= 100);
}

#[tokio::test]
async fn test_pool_stays_bounded() {
    let engine = engine_with(EngineConfig {
        pool_capacity: 10,
        ..EngineConfig::default()
    });
    for seed in 0..40u8 {
        engine
            .store_file("f", &sample_data(512, seed), "x", &StorePolicy::natural_pool())
            .await
            .unwrap();
    }
    assert_eq!(engine.pool(BlockTier::Nano).size(), 10);
    assert_eq!(engine.stats().pools[0].size, 10);
}

#[tokio::test]
async fn test_retrievals_bump_popularity() {
    let engine = memory_engine();
    let out = engine
        .store_file("f", b"abc", "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    engine.retrieve_file(&out.manifest.file_id, 0, None).await.unwrap();
    assert_eq!(out.manifest.popularity_score(), 2);

    let quiet = engine_with(EngineConfig {
        count_retrievals: false,
        ..EngineConfig::default()
    });
    let out = quiet
        .store_file("f", b"abc", "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    quiet.retrieve_file(&out.manifest.file_id, 0, None).await.unwrap();
    assert_eq!(out.manifest.popularity_score(), 1);
}

#[tokio::test]
async fn test_stats_track_activity() {
    let engine = memory_engine();
    let out = engine
        .store_file("f", &sample_data(2048, 4), "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    engine.retrieve_file(&out.manifest.file_id, 0, None).await.unwrap();

    let stats = engine.stats();
    assert_eq!(stats.manifests, 1);
    assert_eq!(stats.files_stored, 1);
    assert_eq!(stats.retrievals, 1);
    assert_eq!(stats.blocks_decoded, 2);
    assert_eq!(stats.blocks_stored, out.new_blocks_stored);
    assert!(stats.cache.hits > 0);
    assert!(stats.cache_memory_bytes > 0);
}

#[tokio::test(start_paused = true)]
async fn test_store_timeout_registers_nothing() {
    common::init_tracing();
    let config = EngineConfig {
        operation_timeout_ms: Some(20),
        ..EngineConfig::default()
    };
    let engine =
        StorageEngine::new(config, Arc::new(SlowStore::new(Duration::from_millis(200)))).unwrap();
    let err = engine
        .store_file("slow", b"data", "x", &StorePolicy::natural_pool())
        .await
        .unwrap_err();
    assert!(matches!(err, RandomFsError::Timeout { after_ms: 20 }));
    assert!(err.is_transient());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn test_publish_and_open_url() {
    let engine = memory_engine();
    let data = sample_data(2500, 8);
    let out = engine
        .store_file("movie name.mkv", &data, "video/x-matroska", &StorePolicy::natural_pool())
        .await
        .unwrap();
    let url = engine.publish_manifest(&out.manifest.file_id).await.unwrap();
    assert_eq!(url.file_name, "movie name.mkv");
    assert_eq!(url.file_size, 2500);

    let text = url.to_string();
    assert!(text.starts_with("rd://randomfs/v4/2500/"));
    let parsed: RandomUrl = text.parse().unwrap();
    assert_eq!(parsed, url);

    // second engine sharing the store but not the registry
    let reader = StorageEngine::new(EngineConfig::default(), Arc::clone(engine.store())).unwrap();
    assert!(reader.registry().is_empty());
    let manifest = reader.open_url(&parsed).await.unwrap();
    assert_eq!(manifest.file_id, out.manifest.file_id);
    assert_eq!(manifest.content_type, "video/x-matroska");
    let (back, _) = reader.retrieve_file(&manifest.file_id, 0, None).await.unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn test_publish_unnamed_file() {
    let engine = memory_engine();
    let data = sample_data(10, 3);
    let out = engine
        .store_file("", &data, "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    let url = engine.publish_manifest(&out.manifest.file_id).await.unwrap();
    let parsed: RandomUrl = url.to_string().parse().unwrap();
    assert_eq!(parsed, url);

    let reader = StorageEngine::new(EngineConfig::default(), Arc::clone(engine.store())).unwrap();
    let manifest = reader.open_url(&parsed).await.unwrap();
    assert!(manifest.file_name.is_empty());
    let (back, _) = reader.retrieve_file(&manifest.file_id, 0, None).await.unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn test_open_url_errors() {
    let engine = memory_engine();
    let out = engine
        .store_file("f", b"abc", "x", &StorePolicy::natural_pool())
        .await
        .unwrap();
    let url = engine.publish_manifest(&out.manifest.file_id).await.unwrap();

    let mut old = url.clone();
    old.version = "v3".to_string();
    assert!(matches!(
        engine.open_url(&old).await,
        Err(RandomFsError::InvalidUrl(_))
    ));

    let mut dangling = url.clone();
    dangling.manifest_hash = out.manifest.file_id;
    assert!(matches!(
        engine.open_url(&dangling).await,
        Err(RandomFsError::BlockNotFound { .. })
    ));

    // a stored block is not a manifest
    let mut not_manifest = url.clone();
    not_manifest.manifest_hash = out.manifest.blocks[0].stored_hash;
    assert!(matches!(
        engine.open_url(&not_manifest).await,
        Err(RandomFsError::CorruptManifest(_))
    ));

    let mut wrong_size = url;
    wrong_size.file_size = 4;
    assert!(matches!(
        engine.open_url(&wrong_size).await,
        Err(RandomFsError::CorruptManifest(_))
    ));
}

#[tokio::test]
async fn test_dir_store_end_to_end() {
    common::init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let data = sample_data(3000, 21);

    let url = {
        let store = Arc::new(DirContentStore::open(dir.path()).await.unwrap());
        let engine = StorageEngine::new(EngineConfig::default(), store).unwrap();
        let out = engine
            .store_file("disk.bin", &data, "x", &StorePolicy::natural_pool())
            .await
            .unwrap();
        engine.publish_manifest(&out.manifest.file_id).await.unwrap()
    };

    // fresh engine over the same directory
    let store = Arc::new(DirContentStore::open(dir.path()).await.unwrap());
    let engine = StorageEngine::new(EngineConfig::default(), store).unwrap();
    let manifest = engine.open_url(&url).await.unwrap();
    let (back, _) = engine.retrieve_file(&manifest.file_id, 0, None).await.unwrap();
    assert_eq!(&back[..], &data[..]);
}
