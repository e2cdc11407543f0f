//! Disk Cache Metrics
//!
//! Per-disk atomic counters read by operators and tests. A leaf of the
//! component graph: everything updates it, nothing is owned by it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one disk cache
#[derive(Debug, Default)]
pub struct DiskCacheMetrics {
    /// Blocks currently staged (written, not yet uploaded)
    pub stage_blocks: AtomicU64,
    /// Stage calls rejected by admission
    pub stage_skips: AtomicU64,
    /// Cache hits served from the local disk
    pub cache_hits: AtomicU64,
    /// Cache misses
    pub cache_misses: AtomicU64,
    /// Entries evicted by the capacity sweep
    pub cache_evictions: AtomicU64,
    /// Entries evicted by the expiry sweep
    pub cache_expirations: AtomicU64,
    /// Blocks successfully uploaded to the object store
    pub uploaded_blocks: AtomicU64,
    /// Bytes successfully uploaded
    pub uploaded_bytes: AtomicU64,
    /// Upload attempts that failed and were retried
    pub upload_retries: AtomicU64,
    /// Orphaned stage blocks re-enqueued by the loader
    pub orphans_requeued: AtomicU64,
    /// Pre-existing cache files ingested by the loader
    pub cache_files_loaded: AtomicU64,
}

impl DiskCacheMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_stage(&self) {
        self.stage_blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stage_removed(&self) {
        // Saturating: a remove may race a loader rescan after restart.
        let _ = self
            .stage_blocks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    #[inline]
    pub fn record_stage_skip(&self) {
        self.stage_skips.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expiration(&self) {
        self.cache_expirations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded_blocks.fetch_add(1, Ordering::Relaxed);
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload_retry(&self) {
        self.upload_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orphan_requeued(&self) {
        self.orphans_requeued.fetch_add(1, Ordering::Relaxed);
        self.stage_blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_file_loaded(&self) {
        self.cache_files_loaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit ratio over all load calls so far (0.0 when idle)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stage_blocks: self.stage_blocks.load(Ordering::Relaxed),
            stage_skips: self.stage_skips.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_expirations: self.cache_expirations.load(Ordering::Relaxed),
            uploaded_blocks: self.uploaded_blocks.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            upload_retries: self.upload_retries.load(Ordering::Relaxed),
            orphans_requeued: self.orphans_requeued.load(Ordering::Relaxed),
            cache_files_loaded: self.cache_files_loaded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`DiskCacheMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub stage_blocks: u64,
    pub stage_skips: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_expirations: u64,
    pub uploaded_blocks: u64,
    pub uploaded_bytes: u64,
    pub upload_retries: u64,
    pub orphans_requeued: u64,
    pub cache_files_loaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_counter_round_trip() {
        let metrics = DiskCacheMetrics::new();
        metrics.record_stage();
        metrics.record_stage();
        metrics.record_stage_removed();

        let snap = metrics.snapshot();
        assert_eq!(snap.stage_blocks, 1);
    }

    #[test]
    fn test_stage_removed_saturates() {
        let metrics = DiskCacheMetrics::new();
        metrics.record_stage_removed();
        assert_eq!(metrics.snapshot().stage_blocks, 0);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = DiskCacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert!((metrics.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_uploaded_accumulates_bytes() {
        let metrics = DiskCacheMetrics::new();
        metrics.record_uploaded(100);
        metrics.record_uploaded(200);

        let snap = metrics.snapshot();
        assert_eq!(snap.uploaded_blocks, 2);
        assert_eq!(snap.uploaded_bytes, 300);
    }
}
