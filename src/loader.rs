//! Startup Disk Scan
//!
//! One-shot scan run at disk init. Two concurrent walks: `stage/` files
//! are orphans from a previous process and are re-enqueued for upload with
//! a `Reload` context; `cache/` files are ingested into the LRU with their
//! mtime as access time.
//!
//! Unparseable names are never deleted: stage-side ones are logged (they
//! may be someone's data), cache-side ones are silently ignored.
//!
//! While the scan is running, reads are served through a file-existence
//! fallback (see `DiskCache::is_cached`) so blocks that have not been
//! ingested yet are still visible.

use crate::block::{BlockContext, BlockKey, CacheValue};
use crate::fs::LocalFs;
use crate::layout::DiskLayout;
use crate::manager::DiskCacheManager;
use crate::metrics::DiskCacheMetrics;
use crate::UploadFn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STATE_IDLE: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_DONE: u8 = 2;

/// One-shot loader for a disk's pre-existing stage and cache files
pub struct DiskCacheLoader {
    layout: DiskLayout,
    fs: Arc<dyn LocalFs>,
    manager: Arc<DiskCacheManager>,
    metrics: Arc<DiskCacheMetrics>,
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiskCacheLoader {
    pub fn new(
        layout: DiskLayout,
        fs: Arc<dyn LocalFs>,
        manager: Arc<DiskCacheManager>,
        metrics: Arc<DiskCacheMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            layout,
            fs,
            manager,
            metrics,
            state: AtomicU8::new(STATE_IDLE),
            task: Mutex::new(None),
        })
    }

    /// Kick off both scans in the background
    pub fn start(self: &Arc<Self>, upload_fn: UploadFn) {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let loader = Arc::clone(self);
        *self.task.lock() = Some(tokio::spawn(async move {
            tokio::join!(loader.scan_stage(&upload_fn), loader.scan_cache());
            loader.state.store(STATE_DONE, Ordering::Release);
            info!(dir = %loader.layout.root_dir().display(), "disk scan finished");
        }));
    }

    /// Whether the scan is still running (enables the existence fallback
    /// in `is_cached`)
    pub fn is_loading(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_LOADING
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn scan_stage(&self, upload_fn: &UploadFn) {
        let stage_dir = self.layout.stage_dir();
        let entries = match self.fs.read_dir(&stage_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %stage_dir.display(), error = %err, "stage scan failed");
                return;
            }
        };

        let mut requeued = 0u64;
        for stat in entries {
            let key = match BlockKey::parse_filename(&stat.name) {
                Ok(key) => key,
                Err(_) => {
                    warn!(
                        dir = %stage_dir.display(),
                        name = %stat.name,
                        "unrecognized stage file left in place"
                    );
                    continue;
                }
            };

            self.manager.stage_added(key, stat.size);
            self.metrics.record_orphan_requeued();
            upload_fn(key, self.layout.stage_path(&key), BlockContext::reload());
            requeued += 1;
        }

        if requeued > 0 {
            info!(requeued, "re-enqueued orphaned stage blocks");
        }
    }

    async fn scan_cache(&self) {
        let cache_dir = self.layout.cache_dir();
        let entries = match self.fs.read_dir(&cache_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %cache_dir.display(), error = %err, "cache scan failed");
                return;
            }
        };

        let mut loaded = 0u64;
        for stat in entries {
            let key = match BlockKey::parse_filename(&stat.name) {
                Ok(key) => key,
                Err(_) => {
                    debug!(name = %stat.name, "ignoring unrecognized cache file");
                    continue;
                }
            };

            self.manager
                .add(key, CacheValue::with_atime(stat.size, stat.mtime));
            self.metrics.record_cache_file_loaded();
            loaded += 1;
        }

        if loaded > 0 {
            info!(loaded, "ingested pre-existing cache blocks");
        }
    }
}

impl Drop for DiskCacheLoader {
    fn drop(&mut self) {
        self.stop();
    }
}
