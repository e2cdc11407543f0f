//! Multi-Disk Facade
//!
//! [`DiskCacheGroup`] spreads blocks across the configured disks by a
//! stable hash of the key and implements the [`CacheStore`] port over the
//! whole set; a disk that is down is skipped by probing forward through
//! the ring, and once every disk is down calls fail with `CacheDown`.
//!
//! [`BlockCacheEngine`] is the assembled subsystem: the group, one upload
//! pipeline per disk, and the shared per-inode flush countdown. This is
//! what the filesystem client embeds.

use crate::block::{Block, BlockContext, BlockKey};
use crate::config::BlockCacheConfig;
use crate::countdown::FlushCountdown;
use crate::disk::{BlockReader, DiskCache};
use crate::error::{CacheError, Result};
use crate::fs::LocalFs;
use crate::object_store::ObjectStoreRef;
use crate::uploader::Uploader;
use crate::{CacheStore, UploadFn};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Stable FNV-1a hash of the key's filename; routing must not change
/// across processes, which rules out the randomized std hasher.
fn key_hash(key: &BlockKey) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.filename().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x1_0000_0000_01b3);
    }
    hash
}

// =============================================================================
// Disk Cache Group
// =============================================================================

/// Hash-routed facade over the configured disks
pub struct DiskCacheGroup {
    disks: Vec<Arc<DiskCache>>,
    quorum: usize,
}

impl DiskCacheGroup {
    pub fn new(cfg: &BlockCacheConfig, fs: Arc<dyn LocalFs>) -> Arc<Self> {
        let disks = cfg
            .disk_dirs
            .iter()
            .map(|dir| DiskCache::new(dir, cfg.disk.clone(), fs.clone()))
            .collect();
        Arc::new(Self {
            disks,
            quorum: cfg.quorum(),
        })
    }

    pub fn disks(&self) -> &[Arc<DiskCache>] {
        &self.disks
    }

    /// Home disk index for a key
    fn home(&self, key: &BlockKey) -> usize {
        (key_hash(key) % self.disks.len() as u64) as usize
    }

    /// Route to the home disk, probing forward past disks that are down
    fn route(&self, key: &BlockKey) -> Result<&Arc<DiskCache>> {
        if self.disks.is_empty() {
            return Err(CacheError::CacheDown);
        }
        let home = self.home(key);
        for offset in 0..self.disks.len() {
            let disk = &self.disks[(home + offset) % self.disks.len()];
            if disk.is_running() {
                return Ok(disk);
            }
        }
        Err(CacheError::CacheDown)
    }

    /// Initialize every disk concurrently, each with its own submission
    /// hook; succeeds when at least the quorum came up.
    pub(crate) async fn init_with<F>(&self, make_upload_fn: F) -> Result<()>
    where
        F: Fn(usize) -> UploadFn,
    {
        if self.disks.is_empty() {
            return Err(CacheError::Internal("no cache disks configured".into()));
        }

        let tasks: Vec<_> = self
            .disks
            .iter()
            .enumerate()
            .map(|(idx, disk)| {
                let disk = Arc::clone(disk);
                let upload_fn = make_upload_fn(idx);
                tokio::spawn(async move { disk.init(upload_fn).await })
            })
            .collect();

        let mut up = 0usize;
        for (idx, task) in tasks.into_iter().enumerate() {
            match task.await {
                Ok(Ok(())) => up += 1,
                Ok(Err(err)) => {
                    warn!(
                        dir = %self.disks[idx].root_dir().display(),
                        error = %err,
                        "disk cache failed to come up"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "disk init task failed");
                }
            }
        }

        if up < self.quorum {
            return Err(CacheError::Internal(format!(
                "only {up}/{} cache disks came up, quorum is {}",
                self.disks.len(),
                self.quorum
            )));
        }
        info!(up, total = self.disks.len(), "disk cache group is up");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskCacheGroup {
    async fn init(&self, upload_fn: UploadFn) -> Result<()> {
        self.init_with(|_| upload_fn.clone()).await
    }

    async fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for disk in &self.disks {
            if let Err(err) = disk.shutdown().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stage(&self, key: &BlockKey, block: Block, ctx: BlockContext) -> Result<()> {
        self.route(key)?.stage(key, block, ctx).await
    }

    async fn remove_stage(&self, key: &BlockKey, ctx: BlockContext) -> Result<()> {
        // No down-disk probing here: removal must reach the home disk even
        // when it is down, and DiskCache::remove_stage accepts that.
        if self.disks.is_empty() {
            return Err(CacheError::CacheDown);
        }
        let home = self.home(key);
        self.disks[home].remove_stage(key, ctx).await
    }

    async fn cache(&self, key: &BlockKey, block: Block) -> Result<()> {
        self.route(key)?.cache(key, block).await
    }

    async fn load(&self, key: &BlockKey) -> Result<BlockReader> {
        self.route(key)?.load(key).await
    }

    fn is_cached(&self, key: &BlockKey) -> bool {
        self.route(key)
            .map(|disk| disk.is_cached(key))
            .unwrap_or(false)
    }

    fn id(&self) -> String {
        "disk-cache-group".to_string()
    }
}

// =============================================================================
// Block Cache Engine
// =============================================================================

/// The assembled block cache: routed disks, one upload pipeline per disk,
/// and the shared flush countdown.
pub struct BlockCacheEngine {
    group: Arc<DiskCacheGroup>,
    uploaders: Vec<Arc<Uploader>>,
    countdown: Arc<FlushCountdown>,
}

impl BlockCacheEngine {
    pub fn new(
        cfg: BlockCacheConfig,
        object_store: ObjectStoreRef,
        fs: Arc<dyn LocalFs>,
    ) -> Arc<Self> {
        let group = DiskCacheGroup::new(&cfg, fs.clone());
        let countdown = FlushCountdown::new();

        let uploaders = group
            .disks()
            .iter()
            .map(|disk| {
                Uploader::new(
                    cfg.disk.uploader.clone(),
                    object_store.clone(),
                    fs.clone(),
                    countdown.clone(),
                    disk.metrics().clone(),
                    cfg.disk.store_prefix.clone(),
                    cfg.disk.drop_page_cache,
                )
            })
            .collect();

        Arc::new(Self {
            group,
            uploaders,
            countdown,
        })
    }

    /// Bring up the uploaders and every disk; quorum rules apply
    pub async fn init(&self) -> Result<()> {
        for (disk, uploader) in self.group.disks().iter().zip(&self.uploaders) {
            let store: Arc<dyn CacheStore> = disk.clone();
            uploader.bind_store(&store);
            uploader.start();
        }
        self.group
            .init_with(|idx| self.uploaders[idx].upload_fn())
            .await
    }

    /// Drain the upload pipelines (bounded by the drain deadline), then
    /// take the disks down.
    pub async fn shutdown(&self) -> Result<()> {
        for uploader in &self.uploaders {
            uploader.shutdown().await;
        }
        self.group.shutdown().await
    }

    pub async fn stage(&self, key: &BlockKey, block: Block, ctx: BlockContext) -> Result<()> {
        self.group.stage(key, block, ctx).await
    }

    pub async fn remove_stage(&self, key: &BlockKey, ctx: BlockContext) -> Result<()> {
        self.group.remove_stage(key, ctx).await
    }

    pub async fn cache(&self, key: &BlockKey, block: Block) -> Result<()> {
        self.group.cache(key, block).await
    }

    pub async fn load(&self, key: &BlockKey) -> Result<BlockReader> {
        self.group.load(key).await
    }

    pub fn is_cached(&self, key: &BlockKey) -> bool {
        self.group.is_cached(key)
    }

    /// Suspend until every synchronously staged block of `ino` is durable
    /// in the object store; errors if any of them failed.
    pub async fn wait_flush(&self, ino: u64) -> Result<()> {
        self.countdown.wait(ino).await
    }

    /// Suspend until every upload pipeline is empty
    pub async fn wait_all_uploaded(&self) {
        for uploader in &self.uploaders {
            uploader.wait_all_uploaded().await;
        }
    }

    /// The routed store underneath
    pub fn store(&self) -> &Arc<DiskCacheGroup> {
        &self.group
    }
}
