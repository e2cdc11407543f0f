//! Block Cache Configuration
//!
//! Plain config structs with defaults; no file loader. One disk budget is
//! split between the stage and cache trees by a fixed ratio, and the sweep
//! water marks are fractions of the cache share.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Configuration for a multi-disk block cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    /// One disk cache per directory; blocks are routed by key hash
    pub disk_dirs: Vec<PathBuf>,
    /// Per-disk tuning, shared by all disks
    pub disk: DiskCacheConfig,
    /// How many disks must come up for `init` to succeed.
    /// `None` means all of them.
    pub init_quorum: Option<usize>,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            disk_dirs: Vec::new(),
            disk: DiskCacheConfig::default(),
            init_quorum: None,
        }
    }
}

impl BlockCacheConfig {
    /// Config for a single cache directory with default tuning
    pub fn single_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_dirs: vec![dir.into()],
            ..Default::default()
        }
    }

    /// Effective init quorum
    pub fn quorum(&self) -> usize {
        self.init_quorum.unwrap_or(self.disk_dirs.len())
    }
}

// =============================================================================
// Per-Disk Configuration
// =============================================================================

/// Configuration for a single disk cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    /// Total disk budget in bytes, split between stage and cache
    pub capacity_bytes: u64,
    /// Fraction of the budget reserved for the stage tree (the cache tree
    /// gets the remainder)
    pub stage_ratio: f64,
    /// TTL for idle cache entries; expired entries are evicted regardless
    /// of capacity
    pub cache_expire_secs: u64,
    /// Capacity sweep starts once cache usage exceeds this fraction of the
    /// cache cap
    pub sweep_high_water: f64,
    /// Capacity sweep evicts until usage is at or below this fraction
    pub sweep_low_water: f64,
    /// Cadence of the capacity sweep
    pub capacity_sweep_interval_ms: u64,
    /// Cadence of the expiry sweep
    pub expire_sweep_interval_ms: u64,
    /// Advise the OS to drop page-cache pages after reading a stage file
    /// for upload
    pub drop_page_cache: bool,
    /// Prefix prepended to object-store keys
    pub store_prefix: String,
    /// Upload pipeline tuning
    pub uploader: UploaderConfig,
    /// Disk health tuning
    pub health: HealthConfig,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
            stage_ratio: 0.5,
            cache_expire_secs: 3 * 24 * 3600,
            sweep_high_water: 0.95,
            sweep_low_water: 0.90,
            capacity_sweep_interval_ms: 1_000,
            expire_sweep_interval_ms: 60_000,
            drop_page_cache: true,
            store_prefix: "blocks".to_string(),
            uploader: UploaderConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl DiskCacheConfig {
    /// Byte cap for the stage tree
    pub fn stage_cap_bytes(&self) -> u64 {
        (self.capacity_bytes as f64 * self.stage_ratio) as u64
    }

    /// Byte cap for the cache tree
    pub fn cache_cap_bytes(&self) -> u64 {
        self.capacity_bytes - self.stage_cap_bytes()
    }

    /// Cache usage at which the capacity sweep kicks in
    pub fn high_water_bytes(&self) -> u64 {
        (self.cache_cap_bytes() as f64 * self.sweep_high_water) as u64
    }

    /// Cache usage the capacity sweep evicts down to
    pub fn low_water_bytes(&self) -> u64 {
        (self.cache_cap_bytes() as f64 * self.sweep_low_water) as u64
    }

    /// Idle TTL as a duration
    pub fn cache_expire(&self) -> Duration {
        Duration::from_secs(self.cache_expire_secs)
    }
}

// =============================================================================
// Uploader Configuration
// =============================================================================

/// Tuning for the per-disk upload pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Parallel upload workers (each owns one serial lane)
    pub upload_workers: usize,
    /// Bounded uploading-queue capacity, shared across lanes
    pub upload_queue_cap: usize,
    /// Scan-worker backoff while the fairness gate holds a batch back
    pub scan_backoff_ms: u64,
    /// How long shutdown waits for in-flight uploads before detaching the
    /// workers
    pub drain_deadline_secs: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            upload_workers: 4,
            upload_queue_cap: 128,
            scan_backoff_ms: 10,
            drain_deadline_secs: 30,
        }
    }
}

impl UploaderConfig {
    /// Per-lane share of the uploading-queue capacity
    pub fn lane_cap(&self) -> usize {
        (self.upload_queue_cap / self.upload_workers.max(1)).max(1)
    }
}

// =============================================================================
// Health Configuration
// =============================================================================

/// Tuning for the disk health state machine and prober
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Cadence of the synthetic probe write/read/unlink
    pub probe_interval_ms: u64,
    /// Length of one I/O-error sample window
    pub sample_window_ms: u64,
    /// Error rate over a sample window that trips Normal -> Unstable
    pub err_rate_threshold: f64,
    /// Consecutive probe failures that trip Unstable -> Bad
    pub probe_fail_threshold: u32,
    /// Consecutive probe successes that recover Bad -> Normal
    pub probe_ok_threshold: u32,
    /// Clean sample windows that recover Unstable -> Normal
    pub recover_window: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 3_000,
            sample_window_ms: 1_000,
            err_rate_threshold: 0.1,
            probe_fail_threshold: 3,
            probe_ok_threshold: 3,
            recover_window: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_split() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 1000,
            stage_ratio: 0.5,
            ..Default::default()
        };
        assert_eq!(cfg.stage_cap_bytes(), 500);
        assert_eq!(cfg.cache_cap_bytes(), 500);

        let skewed = DiskCacheConfig {
            capacity_bytes: 1000,
            stage_ratio: 0.3,
            ..Default::default()
        };
        assert_eq!(skewed.stage_cap_bytes(), 300);
        assert_eq!(skewed.cache_cap_bytes(), 700);
    }

    #[test]
    fn test_water_marks() {
        let cfg = DiskCacheConfig {
            capacity_bytes: 2000,
            stage_ratio: 0.5,
            sweep_high_water: 0.95,
            sweep_low_water: 0.90,
            ..Default::default()
        };
        assert_eq!(cfg.high_water_bytes(), 950);
        assert_eq!(cfg.low_water_bytes(), 900);
    }

    #[test]
    fn test_lane_cap() {
        let cfg = UploaderConfig {
            upload_workers: 4,
            upload_queue_cap: 128,
            ..Default::default()
        };
        assert_eq!(cfg.lane_cap(), 32);

        // Degenerate settings still leave every lane usable.
        let tiny = UploaderConfig {
            upload_workers: 8,
            upload_queue_cap: 4,
            ..Default::default()
        };
        assert_eq!(tiny.lane_cap(), 1);
    }

    #[test]
    fn test_quorum_default_is_all() {
        let cfg = BlockCacheConfig {
            disk_dirs: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            ..Default::default()
        };
        assert_eq!(cfg.quorum(), 2);

        let relaxed = BlockCacheConfig {
            disk_dirs: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            init_quorum: Some(1),
            ..Default::default()
        };
        assert_eq!(relaxed.quorum(), 1);
    }
}
