//! Engine counters exported as named metrics.
//!
//! Every counter is an `AtomicU64` updated lock-free from the per-block tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The type of metric: counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up or down.
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

impl EngineMetric {
    fn counter(name: &str, help: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(value),
        }
    }

    fn gauge(name: &str, help: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind: MetricKind::Gauge,
            value: MetricValue::Gauge(value),
        }
    }
}

/// Lock-free counters for store and retrieve activity.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    files_stored: AtomicU64,
    file_dedup_hits: AtomicU64,
    blocks_encoded: AtomicU64,
    blocks_stored: AtomicU64,
    block_dedup_hits: AtomicU64,
    fallback_masks: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    retrievals: AtomicU64,
    blocks_decoded: AtomicU64,
    bytes_retrieved: AtomicU64,
    failed_operations: AtomicU64,
}

impl EngineMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A file was stored (or matched a registered manifest) with `bytes` of input.
    #[inline]
    pub fn record_file_stored(&self, bytes: u64, deduplicated: bool) {
        self.files_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        if deduplicated {
            self.file_dedup_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A block was encoded; `written` is false when an identical stored block already existed.
    #[inline]
    pub fn record_block_encoded(&self, bytes: u64, written: bool) {
        self.blocks_encoded.fetch_add(1, Ordering::Relaxed);
        if written {
            self.blocks_stored.fetch_add(1, Ordering::Relaxed);
            self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.block_dedup_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `count` fresh random masks were generated because the pool was too small.
    #[inline]
    pub fn record_fallback_masks(&self, count: u64) {
        self.fallback_masks.fetch_add(count, Ordering::Relaxed);
    }

    /// A fresh fallback mask was written to the content store.
    #[inline]
    pub fn record_mask_written(&self, bytes: u64) {
        self.blocks_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A retrieval stream was opened.
    #[inline]
    pub fn record_retrieval(&self) {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
    }

    /// A block was decoded and `bytes` of payload handed to the reader.
    #[inline]
    pub fn record_block_decoded(&self, bytes: u64) {
        self.blocks_decoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_retrieved.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A store or retrieve aborted with an error.
    #[inline]
    pub fn record_failure(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Files stored so far, including manifest dedup hits.
    pub fn files_stored(&self) -> u64 {
        self.files_stored.load(Ordering::Relaxed)
    }

    /// Blocks written to the content store, masks included.
    pub fn blocks_stored(&self) -> u64 {
        self.blocks_stored.load(Ordering::Relaxed)
    }

    /// Stores answered from the manifest registry.
    pub fn file_dedup_hits(&self) -> u64 {
        self.file_dedup_hits.load(Ordering::Relaxed)
    }

    /// Encoded blocks that matched an existing stored block.
    pub fn block_dedup_hits(&self) -> u64 {
        self.block_dedup_hits.load(Ordering::Relaxed)
    }

    /// Fresh masks generated on pool underflow.
    pub fn fallback_masks(&self) -> u64 {
        self.fallback_masks.load(Ordering::Relaxed)
    }

    /// Retrieval streams opened.
    pub fn retrievals(&self) -> u64 {
        self.retrievals.load(Ordering::Relaxed)
    }

    /// Blocks decoded for readers.
    pub fn blocks_decoded(&self) -> u64 {
        self.blocks_decoded.load(Ordering::Relaxed)
    }

    /// Failed operations.
    pub fn failed_operations(&self) -> u64 {
        self.failed_operations.load(Ordering::Relaxed)
    }

    /// Stored bytes per input byte. 0.0 before anything was stored.
    pub fn storage_overhead(&self) -> f64 {
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        if bytes_in == 0 {
            0.0
        } else {
            bytes_out as f64 / bytes_in as f64
        }
    }

    /// Collect all metrics with Prometheus-style names.
    pub fn collect(&self) -> Vec<EngineMetric> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            EngineMetric::counter(
                "randomfs_files_stored_total",
                "Files passed to store_file, including manifest dedup hits",
                load(&self.files_stored),
            ),
            EngineMetric::counter(
                "randomfs_file_dedup_hits_total",
                "Stores answered by an already registered manifest",
                load(&self.file_dedup_hits),
            ),
            EngineMetric::counter(
                "randomfs_blocks_encoded_total",
                "Payload blocks encoded",
                load(&self.blocks_encoded),
            ),
            EngineMetric::counter(
                "randomfs_blocks_stored_total",
                "Blocks written to the content store, fallback masks included",
                load(&self.blocks_stored),
            ),
            EngineMetric::counter(
                "randomfs_block_dedup_hits_total",
                "Encoded blocks identical to an existing stored block",
                load(&self.block_dedup_hits),
            ),
            EngineMetric::counter(
                "randomfs_fallback_masks_total",
                "Fresh random masks generated on pool underflow",
                load(&self.fallback_masks),
            ),
            EngineMetric::counter(
                "randomfs_bytes_in_total",
                "File bytes submitted for storage",
                load(&self.bytes_in),
            ),
            EngineMetric::counter(
                "randomfs_bytes_out_total",
                "Block bytes written to the content store",
                load(&self.bytes_out),
            ),
            EngineMetric::gauge(
                "randomfs_storage_overhead_ratio",
                "Stored bytes per submitted byte (bytes_out / bytes_in)",
                self.storage_overhead(),
            ),
            EngineMetric::counter(
                "randomfs_retrievals_total",
                "Retrieval streams opened",
                load(&self.retrievals),
            ),
            EngineMetric::counter(
                "randomfs_blocks_decoded_total",
                "Blocks decoded for readers",
                load(&self.blocks_decoded),
            ),
            EngineMetric::counter(
                "randomfs_bytes_retrieved_total",
                "Payload bytes returned to readers",
                load(&self.bytes_retrieved),
            ),
            EngineMetric::counter(
                "randomfs_failed_operations_total",
                "Store or retrieve operations that aborted with an error",
                load(&self.failed_operations),
            ),
        ]
    }
}
