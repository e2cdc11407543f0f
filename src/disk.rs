//! Single-Disk Cache
//!
//! One disk cache owns its layout, health machine, capacity manager, and
//! startup loader, and implements the full [`CacheStore`] port.
//!
//! A staged block is written under `stage/` (the authoritative copy),
//! hard-linked into `cache/` so it is immediately readable, and handed to
//! the upload hook. The link is opportunistic: if it fails the stage file
//! still uploads, the block just is not locally readable.

use crate::block::{Block, BlockContext, BlockKey, CacheValue};
use crate::config::DiskCacheConfig;
use crate::error::{CacheError, Result};
use crate::fs::{HealthWatchedFs, LocalFs};
use crate::health::DiskHealth;
use crate::layout::DiskLayout;
use crate::loader::DiskCacheLoader;
use crate::manager::DiskCacheManager;
use crate::metrics::DiskCacheMetrics;
use crate::{CacheStore, UploadFn};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Admission wants the disk to be running and healthy
pub const WANT_EXEC: u8 = 0b001;
/// Admission wants room in the stage tree
pub const WANT_STAGE: u8 = 0b010;
/// Admission wants room in the cache tree
pub const WANT_CACHE: u8 = 0b100;

// =============================================================================
// Block Reader
// =============================================================================

/// Positioned reader over one cached block. Owns the descriptor; the block
/// stays readable even if it is evicted after the open.
#[derive(Debug)]
pub struct BlockReader {
    file: std::fs::File,
}

impl BlockReader {
    pub(crate) fn new(file: std::fs::File) -> Self {
        Self { file }
    }

    /// Read exactly `length` bytes starting at `offset`
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Bytes> {
        use std::os::unix::fs::FileExt;

        let mut buf = BytesMut::zeroed(length);
        let mut read = 0usize;
        while read < length {
            let n = self
                .file
                .read_at(&mut buf[read..], offset + read as u64)
                .map_err(crate::error::from_io)?;
            if n == 0 {
                return Err(CacheError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("block ended {} bytes short", length - read),
                )));
            }
            read += n;
        }
        Ok(buf.freeze())
    }

    /// Size of the underlying block file
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(crate::error::from_io)?.len())
    }
}

// =============================================================================
// Disk Cache
// =============================================================================

/// A single disk's block cache
pub struct DiskCache {
    cfg: DiskCacheConfig,
    layout: DiskLayout,
    /// Undecorated filesystem, used by the health prober
    raw_fs: Arc<dyn LocalFs>,
    /// Health-sampled filesystem, used by every data-path operation
    fs: Arc<dyn LocalFs>,
    health: Arc<DiskHealth>,
    manager: Arc<DiskCacheManager>,
    loader: Arc<DiskCacheLoader>,
    metrics: Arc<DiskCacheMetrics>,
    running: AtomicBool,
    use_direct_write: AtomicBool,
    uuid: RwLock<String>,
    upload_fn: RwLock<Option<UploadFn>>,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, cfg: DiskCacheConfig, fs: Arc<dyn LocalFs>) -> Arc<Self> {
        let layout = DiskLayout::new(dir);
        let metrics = Arc::new(DiskCacheMetrics::new());
        let health = DiskHealth::new(cfg.health.clone());
        let watched: Arc<dyn LocalFs> = HealthWatchedFs::new(fs.clone(), health.clone());
        let manager = DiskCacheManager::new(
            cfg.clone(),
            layout.clone(),
            watched.clone(),
            metrics.clone(),
        );
        let loader = DiskCacheLoader::new(
            layout.clone(),
            watched.clone(),
            manager.clone(),
            metrics.clone(),
        );

        Arc::new(Self {
            cfg,
            layout,
            raw_fs: fs,
            fs: watched,
            health,
            manager,
            loader,
            metrics,
            running: AtomicBool::new(false),
            use_direct_write: AtomicBool::new(false),
            uuid: RwLock::new(String::new()),
            upload_fn: RwLock::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<DiskCacheMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<DiskHealth> {
        &self.health
    }

    pub fn manager(&self) -> &Arc<DiskCacheManager> {
        &self.manager
    }

    pub fn root_dir(&self) -> &std::path::Path {
        self.layout.root_dir()
    }

    /// Gate every operation on running state, health, and capacity
    fn check(&self, want: u8) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(CacheError::CacheDown);
        }
        if want & WANT_EXEC != 0 && !self.health.is_healthy() {
            return Err(CacheError::CacheUnhealthy);
        }
        if want & WANT_STAGE != 0 && self.manager.stage_full() {
            return Err(CacheError::CacheFull);
        }
        if want & WANT_CACHE != 0 && self.manager.cache_full() {
            return Err(CacheError::CacheFull);
        }
        Ok(())
    }

    async fn create_dirs(&self) -> Result<()> {
        for dir in self.layout.dirs() {
            self.fs.mkdir_p(&dir).await?;
        }
        Ok(())
    }

    /// Read or create the uuid lock file; its contents identify the disk
    /// across restarts and moves.
    async fn load_lock_file(&self) -> Result<()> {
        let lock_path = self.layout.lock_path();
        let uuid = match self.fs.read_file(&lock_path, false).await {
            Ok(body) => String::from_utf8_lossy(&body).trim().to_string(),
            Err(CacheError::NotFound) => {
                let fresh = uuid::Uuid::new_v4().to_string();
                self.fs
                    .write_file(&lock_path, fresh.as_bytes(), false)
                    .await?;
                fresh
            }
            Err(err) => return Err(err),
        };
        *self.uuid.write() = uuid;
        Ok(())
    }

    /// Probe the filesystem once; tmpfs and friends reject `O_DIRECT` and
    /// fall back to buffered writes.
    async fn detect_direct_io(&self) {
        let supported = self
            .fs
            .supports_direct_io(&self.layout.detect_path())
            .await;
        self.use_direct_write.store(supported, Ordering::Release);
        info!(
            dir = %self.layout.root_dir().display(),
            direct_io = supported,
            "probed direct I/O support"
        );
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    async fn init(&self, upload_fn: UploadFn) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(()); // already running
        }

        self.create_dirs().await?;
        self.load_lock_file().await?;
        self.detect_direct_io().await;

        *self.upload_fn.write() = Some(upload_fn.clone());

        // Start order matters: health sampling first, then capacity
        // management, then the scan that may enqueue uploads.
        self.health
            .start(self.layout.probe_dir(), self.raw_fs.clone());
        self.manager.start();
        self.loader.start(upload_fn);

        info!(dir = %self.layout.root_dir().display(), uuid = %self.id(), "disk cache is up");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.loader.stop();
        self.manager.stop();
        self.health.stop();

        info!(dir = %self.layout.root_dir().display(), "disk cache is down");
        Ok(())
    }

    async fn stage(&self, key: &BlockKey, block: Block, ctx: BlockContext) -> Result<()> {
        if let Err(err) = self.check(WANT_EXEC | WANT_STAGE) {
            self.metrics.record_stage_skip();
            return Err(err);
        }

        let started = Instant::now();
        let stage_path = self.layout.stage_path(key);
        let cache_path = self.layout.cache_path(key);
        let size = block.size();

        let direct = self.use_direct_write.load(Ordering::Acquire);
        self.fs.write_file(&stage_path, &block.data, direct).await?;
        self.manager.stage_added(*key, size);

        // Opportunistic read-side mirror; the stage file is authoritative.
        match self.fs.hardlink(&stage_path, &cache_path).await {
            Ok(()) => self.manager.add(*key, CacheValue::new(size)),
            Err(err) => {
                warn!(
                    key = %key,
                    error = %err,
                    "failed to link stage block into cache, continuing"
                );
            }
        }

        match self.upload_fn.read().clone() {
            Some(upload_fn) => upload_fn(*key, stage_path, ctx),
            None => warn!(key = %key, "no upload hook bound, stage block not enqueued"),
        }

        self.metrics.record_stage();
        debug!(
            key = %key,
            size,
            elapsed_us = started.elapsed().as_micros() as u64,
            "staged block"
        );
        Ok(())
    }

    async fn remove_stage(&self, key: &BlockKey, _ctx: BlockContext) -> Result<()> {
        // Deliberately unchecked: upload completions and GC must be able
        // to delete even when the disk is down or unhealthy.
        self.manager.stage_removed(key);
        match self.fs.unlink(&self.layout.stage_path(key)).await {
            Ok(()) | Err(CacheError::NotFound) => {
                self.metrics.record_stage_removed();
                debug!(key = %key, "removed stage block");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn cache(&self, key: &BlockKey, block: Block) -> Result<()> {
        self.check(WANT_EXEC | WANT_CACHE)?;

        let size = block.size();
        self.fs
            .write_file(&self.layout.cache_path(key), &block.data, false)
            .await?;
        self.manager.add(*key, CacheValue::new(size));

        debug!(key = %key, size, "cached block");
        Ok(())
    }

    async fn load(&self, key: &BlockKey) -> Result<BlockReader> {
        self.check(WANT_EXEC)?;

        let cache_path = self.layout.cache_path(key);
        let tracked = self.manager.get(key).is_ok();
        if !tracked && !(self.loader.is_loading() && self.fs.exists(&cache_path).await) {
            self.metrics.record_cache_miss();
            return Err(CacheError::NotFound);
        }

        match self.fs.open_read(&cache_path).await {
            Ok(file) => {
                self.metrics.record_cache_hit();
                Ok(BlockReader::new(file))
            }
            Err(CacheError::NotFound) => {
                // The file was deleted out-of-band; drop the stale entry.
                let _ = self.manager.delete(key).await;
                self.metrics.record_cache_miss();
                Err(CacheError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    fn is_cached(&self, key: &BlockKey) -> bool {
        if self.manager.contains(key) {
            return true;
        }
        // Until the startup scan finishes, fall back to the file itself so
        // not-yet-ingested blocks stay visible.
        self.loader.is_loading() && self.layout.cache_path(key).exists()
    }

    fn id(&self) -> String {
        self.uuid.read().clone()
    }
}
