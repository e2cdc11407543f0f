//! Disk Capacity Management
//!
//! Per-disk bookkeeping: the recency-ordered cache index with its byte
//! total, the stage-tree byte total, the `stage_full`/`cache_full`
//! admission predicates, and the two background sweeps (idle-expiry and
//! high/low-water capacity eviction).
//!
//! The LRU mutex is held only across index mutations; file unlinks happen
//! after it is released.

use crate::block::{BlockKey, CacheValue};
use crate::config::DiskCacheConfig;
use crate::error::{CacheError, Result};
use crate::fs::LocalFs;
use crate::layout::DiskLayout;
use crate::metrics::DiskCacheMetrics;
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity and recency state for one disk
pub struct DiskCacheManager {
    cfg: DiskCacheConfig,
    layout: DiskLayout,
    fs: Arc<dyn LocalFs>,
    metrics: Arc<DiskCacheMetrics>,
    /// Cache entries. Touches move entries to the back, but the sweeps
    /// trust each entry's `atime`, not its position: startup ingestion
    /// appends in directory-walk order, which need not match recency.
    lru: Mutex<IndexMap<BlockKey, CacheValue>>,
    cache_bytes: AtomicU64,
    stage_bytes: AtomicU64,
    /// Size of every live stage file, for exact accounting on removal
    stage_sizes: DashMap<BlockKey, u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiskCacheManager {
    pub fn new(
        cfg: DiskCacheConfig,
        layout: DiskLayout,
        fs: Arc<dyn LocalFs>,
        metrics: Arc<DiskCacheMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            layout,
            fs,
            metrics,
            lru: Mutex::new(IndexMap::new()),
            cache_bytes: AtomicU64::new(0),
            stage_bytes: AtomicU64::new(0),
            stage_sizes: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Cache index
    // =========================================================================

    /// Track a cache file. Idempotent on the key: re-adding refreshes the
    /// access time and moves the entry to most-recently-used.
    pub fn add(&self, key: BlockKey, value: CacheValue) {
        let mut lru = self.lru.lock();
        if let Some(old) = lru.shift_remove(&key) {
            self.cache_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.cache_bytes.fetch_add(value.size, Ordering::Relaxed);
        lru.insert(key, value);
    }

    /// Look up and touch an entry, moving it to most-recently-used
    pub fn get(&self, key: &BlockKey) -> Result<CacheValue> {
        let mut lru = self.lru.lock();
        match lru.shift_remove(key) {
            Some(mut value) => {
                value.atime = Utc::now();
                lru.insert(*key, value);
                Ok(value)
            }
            None => Err(CacheError::NotFound),
        }
    }

    /// Non-touching membership check
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.lru.lock().contains_key(key)
    }

    /// Untrack an entry and delete its cache file. Tolerates both the
    /// entry and the file being already gone.
    pub async fn delete(&self, key: &BlockKey) -> Result<()> {
        let removed = {
            let mut lru = self.lru.lock();
            lru.shift_remove(key)
        };
        if let Some(value) = removed {
            self.cache_bytes.fetch_sub(value.size, Ordering::Relaxed);
        }

        match self.fs.unlink(&self.layout.cache_path(key)).await {
            Ok(()) | Err(CacheError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Stage accounting
    // =========================================================================

    /// Account a newly written (or rediscovered) stage file
    pub fn stage_added(&self, key: BlockKey, size: u64) {
        if let Some(old) = self.stage_sizes.insert(key, size) {
            self.stage_bytes.fetch_sub(old, Ordering::Relaxed);
        }
        self.stage_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Release the accounting for a removed stage file
    pub fn stage_removed(&self, key: &BlockKey) -> Option<u64> {
        let (_, size) = self.stage_sizes.remove(key)?;
        self.stage_bytes.fetch_sub(size, Ordering::Relaxed);
        Some(size)
    }

    // =========================================================================
    // Admission predicates (lock-free reads)
    // =========================================================================

    pub fn stage_full(&self) -> bool {
        self.stage_bytes.load(Ordering::Relaxed) >= self.cfg.stage_cap_bytes()
    }

    pub fn cache_full(&self) -> bool {
        self.cache_bytes.load(Ordering::Relaxed) >= self.cfg.cache_cap_bytes()
    }

    pub fn used_cache_bytes(&self) -> u64 {
        self.cache_bytes.load(Ordering::Relaxed)
    }

    pub fn used_stage_bytes(&self) -> u64 {
        self.stage_bytes.load(Ordering::Relaxed)
    }

    pub fn cache_entries(&self) -> usize {
        self.lru.lock().len()
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Start the capacity and expiry sweep timers
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let manager = Arc::clone(self);
        let interval = Duration::from_millis(self.cfg.capacity_sweep_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.capacity_sweep().await;
            }
        }));

        let manager = Arc::clone(self);
        let interval = Duration::from_millis(self.cfg.expire_sweep_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.expire_sweep().await;
            }
        }));
    }

    /// Stop the sweep timers
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// While usage exceeds the high water mark, evict the oldest entries
    /// until it is at or below the low water mark.
    ///
    /// Victims are picked by access time, not map position: the startup
    /// scan ingests cache files in directory-walk order with historical
    /// mtimes, so positional order is no proxy for recency.
    pub async fn capacity_sweep(&self) {
        if self.used_cache_bytes() <= self.cfg.high_water_bytes() {
            return;
        }

        let low_water = self.cfg.low_water_bytes();
        let mut victims = Vec::new();
        {
            let mut lru = self.lru.lock();
            let mut candidates: Vec<(BlockKey, CacheValue)> =
                lru.iter().map(|(key, value)| (*key, *value)).collect();
            candidates.sort_by_key(|(_, value)| value.atime);

            let mut used = self.cache_bytes.load(Ordering::Relaxed);
            for (key, value) in candidates {
                if used <= low_water {
                    break;
                }
                if lru.shift_remove(&key).is_some() {
                    self.cache_bytes.fetch_sub(value.size, Ordering::Relaxed);
                    used = used.saturating_sub(value.size);
                    victims.push((key, value.size));
                }
            }
        }

        if victims.is_empty() {
            return;
        }

        let freed: u64 = victims.iter().map(|(_, size)| size).sum();
        info!(
            evicted = victims.len(),
            freed, "capacity sweep evicting cache blocks"
        );

        for (key, _) in victims {
            self.unlink_evicted(&key).await;
            self.metrics.record_eviction();
        }
    }

    /// Evict entries idle past the configured TTL, regardless of capacity.
    ///
    /// Every entry is checked: a stale block ingested late in the startup
    /// walk sits behind fresher ones, so stopping at the first live entry
    /// would strand it forever.
    pub async fn expire_sweep(&self) {
        if self.cfg.cache_expire_secs == 0 {
            return;
        }

        let ttl = self.cfg.cache_expire_secs;
        let mut victims = Vec::new();
        {
            let mut lru = self.lru.lock();
            let expired: Vec<BlockKey> = lru
                .iter()
                .filter(|(_, value)| value.idle_secs() > ttl)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                if let Some(value) = lru.shift_remove(&key) {
                    self.cache_bytes.fetch_sub(value.size, Ordering::Relaxed);
                    victims.push(key);
                }
            }
        }

        if victims.is_empty() {
            return;
        }

        debug!(expired = victims.len(), "expiry sweep evicting idle blocks");
        for key in victims {
            self.unlink_evicted(&key).await;
            self.metrics.record_expiration();
        }
    }

    async fn unlink_evicted(&self, key: &BlockKey) {
        match self.fs.unlink(&self.layout.cache_path(key)).await {
            Ok(()) | Err(CacheError::NotFound) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "failed to unlink evicted cache block");
            }
        }
    }
}

impl Drop for DiskCacheManager {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::PosixFs;
    use tempfile::TempDir;

    async fn test_manager(cfg: DiskCacheConfig) -> (Arc<DiskCacheManager>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let layout = DiskLayout::new(tmp.path());
        let fs = PosixFs::new();
        for dir in layout.dirs() {
            fs.mkdir_p(&dir).await.unwrap();
        }
        let manager = DiskCacheManager::new(cfg, layout, fs, Arc::new(DiskCacheMetrics::new()));
        (manager, tmp)
    }

    fn key(i: u64) -> BlockKey {
        BlockKey::new(1, i, 0, 0, 0)
    }

    async fn put_cache_file(tmp: &TempDir, key: &BlockKey, size: usize) {
        let path = DiskLayout::new(tmp.path()).cache_path(key);
        tokio::fs::write(&path, vec![b'x'; size]).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let (manager, _tmp) = test_manager(DiskCacheConfig::default()).await;

        manager.add(key(1), CacheValue::new(100));
        assert!(manager.contains(&key(1)));
        assert_eq!(manager.used_cache_bytes(), 100);

        let value = manager.get(&key(1)).unwrap();
        assert_eq!(value.size, 100);

        assert!(manager.get(&key(2)).unwrap_err().is_not_found());

        manager.delete(&key(1)).await.unwrap();
        assert!(!manager.contains(&key(1)));
        assert_eq!(manager.used_cache_bytes(), 0);

        // Deleting again is a no-op.
        manager.delete(&key(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_re_add_updates_size_once() {
        let (manager, _tmp) = test_manager(DiskCacheConfig::default()).await;

        manager.add(key(1), CacheValue::new(100));
        manager.add(key(1), CacheValue::new(300));
        assert_eq!(manager.used_cache_bytes(), 300);
        assert_eq!(manager.cache_entries(), 1);
    }

    #[tokio::test]
    async fn test_stage_accounting() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 1000,
            stage_ratio: 0.5,
            ..Default::default()
        };
        let (manager, _tmp) = test_manager(cfg).await;

        assert!(!manager.stage_full());
        manager.stage_added(key(1), 300);
        manager.stage_added(key(2), 200);
        assert_eq!(manager.used_stage_bytes(), 500);
        assert!(manager.stage_full()); // 500 >= cap 500

        assert_eq!(manager.stage_removed(&key(1)), Some(300));
        assert!(!manager.stage_full());
        assert_eq!(manager.stage_removed(&key(1)), None);
    }

    #[tokio::test]
    async fn test_capacity_sweep_evicts_lru_first() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 2000, // cache cap 1000, high 950, low 900
            stage_ratio: 0.5,
            ..Default::default()
        };
        let (manager, tmp) = test_manager(cfg).await;

        for i in 0..5 {
            put_cache_file(&tmp, &key(i), 200).await;
            manager.add(key(i), CacheValue::new(200));
        }
        // Touch key 0 so key 1 becomes the eviction candidate.
        manager.get(&key(0)).unwrap();

        assert_eq!(manager.used_cache_bytes(), 1000);
        manager.capacity_sweep().await;

        assert!(manager.used_cache_bytes() <= 900);
        assert!(!manager.contains(&key(1)));
        assert!(manager.contains(&key(0)));

        // The evicted file is gone from disk, the others remain.
        let layout = DiskLayout::new(tmp.path());
        assert!(!layout.cache_path(&key(1)).exists());
        assert!(layout.cache_path(&key(0)).exists());
    }

    #[tokio::test]
    async fn test_capacity_sweep_idles_below_high_water() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 2000,
            stage_ratio: 0.5,
            ..Default::default()
        };
        let (manager, tmp) = test_manager(cfg).await;

        put_cache_file(&tmp, &key(1), 100).await;
        manager.add(key(1), CacheValue::new(100));

        manager.capacity_sweep().await;
        assert!(manager.contains(&key(1)));
    }

    #[tokio::test]
    async fn test_expire_sweep_evicts_idle_entries() {
        let cfg = DiskCacheConfig {
            cache_expire_secs: 60,
            ..Default::default()
        };
        let (manager, tmp) = test_manager(cfg).await;

        put_cache_file(&tmp, &key(1), 10).await;
        put_cache_file(&tmp, &key(2), 10).await;

        let stale = Utc::now() - chrono::Duration::seconds(120);
        manager.add(key(1), CacheValue::with_atime(10, stale));
        manager.add(key(2), CacheValue::new(10));

        manager.expire_sweep().await;

        assert!(!manager.contains(&key(1)));
        assert!(manager.contains(&key(2)));
        assert_eq!(manager.used_cache_bytes(), 10);
    }

    #[tokio::test]
    async fn test_capacity_sweep_evicts_oldest_atime_despite_ingest_order() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 2000, // cache cap 1000, high 950, low 900
            stage_ratio: 0.5,
            ..Default::default()
        };
        let (manager, tmp) = test_manager(cfg).await;

        // Directory-walk ingestion: a fresh file is discovered first, a
        // genuinely stale one last, so the stale entry sits at the back.
        put_cache_file(&tmp, &key(1), 600).await;
        put_cache_file(&tmp, &key(2), 600).await;
        manager.add(key(1), CacheValue::with_atime(600, Utc::now()));
        manager.add(
            key(2),
            CacheValue::with_atime(600, Utc::now() - chrono::Duration::seconds(1000)),
        );

        manager.capacity_sweep().await;

        // The stale entry is the victim, not whichever sat at the front.
        assert!(manager.contains(&key(1)));
        assert!(!manager.contains(&key(2)));
        assert!(manager.used_cache_bytes() <= 900);
    }

    #[tokio::test]
    async fn test_expire_sweep_reaches_stale_entries_behind_fresh_ones() {
        let cfg = DiskCacheConfig {
            cache_expire_secs: 60,
            ..Default::default()
        };
        let (manager, tmp) = test_manager(cfg).await;

        // Fresh blocks ingested before and after the stale one, so the
        // stale entry is surrounded rather than frontmost.
        for i in 1..=3 {
            put_cache_file(&tmp, &key(i), 10).await;
        }
        manager.add(key(1), CacheValue::new(10));
        manager.add(
            key(2),
            CacheValue::with_atime(10, Utc::now() - chrono::Duration::seconds(120)),
        );
        manager.add(key(3), CacheValue::new(10));

        manager.expire_sweep().await;

        assert!(manager.contains(&key(1)));
        assert!(!manager.contains(&key(2)));
        assert!(manager.contains(&key(3)));
        assert_eq!(manager.used_cache_bytes(), 20);
    }

    #[tokio::test]
    async fn test_expire_sweep_disabled_by_zero_ttl() {
        let cfg = DiskCacheConfig {
            cache_expire_secs: 0,
            ..Default::default()
        };
        let (manager, _tmp) = test_manager(cfg).await;

        let stale = Utc::now() - chrono::Duration::days(30);
        manager.add(key(1), CacheValue::with_atime(10, stale));
        manager.expire_sweep().await;
        assert!(manager.contains(&key(1)));
    }

    #[tokio::test]
    async fn test_background_sweeps_run() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 2000,
            stage_ratio: 0.5,
            capacity_sweep_interval_ms: 20,
            expire_sweep_interval_ms: 20,
            ..Default::default()
        };
        let (manager, tmp) = test_manager(cfg).await;

        for i in 0..6 {
            put_cache_file(&tmp, &key(i), 200).await;
            manager.add(key(i), CacheValue::new(200));
        }
        manager.start();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(manager.used_cache_bytes() <= 900);
        manager.stop();
    }
}
