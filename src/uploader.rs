//! Upload Pipeline
//!
//! Moves staged blocks to the object store through two queues:
//!
//! ```text
//!  submit ──▶ pending (unbounded) ──scan──▶ lanes (bounded) ──workers──▶ PUT
//! ```
//!
//! The scan task promotes one batch at a time, holding background traffic
//! back whenever the bounded side is more than half full so a synchronous
//! flush can always overtake it. Each worker owns one lane; a block's lane
//! is chosen by hashing `(ino, chunk_id, index)`, so uploads for the same
//! block slot complete in submission (`seq`) order while distinct slots
//! proceed in parallel.
//!
//! A PUT that fails is retried forever with capped exponential backoff;
//! only a successful PUT or a vanished stage file completes a block. On
//! success the stage file is removed through the owning store so capacity
//! accounting stays exact.

use crate::block::{BlockContext, BlockFrom, BlockKey, StageBlock};
use crate::config::UploaderConfig;
use crate::countdown::FlushCountdown;
use crate::error::CacheError;
use crate::fs::LocalFs;
use crate::metrics::DiskCacheMetrics;
use crate::object_store::ObjectStoreRef;
use crate::{CacheStore, UploadFn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Process-wide stage sequence; strictly increasing across every stage
/// call so lane ordering has a total tie-breaker.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

const RETRY_BASE_MS: u64 = 100;
const RETRY_CAP_MS: u64 = 10_000;

fn retry_backoff(attempt: u32) -> Duration {
    let exp = attempt.min(16);
    Duration::from_millis((RETRY_BASE_MS << exp).min(RETRY_CAP_MS))
}

// =============================================================================
// Pending Queue
// =============================================================================

/// Unbounded intake queue. Backpressure comes from the disk write before
/// submission, never from here.
#[derive(Default)]
struct PendingQueue {
    blocks: Mutex<VecDeque<StageBlock>>,
}

impl PendingQueue {
    fn push(&self, block: StageBlock) {
        self.blocks.lock().push_back(block);
    }

    /// Clone the front batch without removing it: the contiguous run of
    /// blocks sharing the head's `(ino, from)`, i.e. one producer flush.
    fn peek_batch(&self) -> Vec<StageBlock> {
        let blocks = self.blocks.lock();
        Self::batch_range(&blocks)
            .map(|n| blocks.iter().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return the front batch
    fn pop_batch(&self) -> Vec<StageBlock> {
        let mut blocks = self.blocks.lock();
        match Self::batch_range(&blocks) {
            Some(n) => blocks.drain(..n).collect(),
            None => Vec::new(),
        }
    }

    fn batch_range(blocks: &VecDeque<StageBlock>) -> Option<usize> {
        let head = blocks.front()?;
        let ino = head.key.ino;
        let from = head.ctx.from;
        Some(
            blocks
                .iter()
                .take_while(|b| b.key.ino == ino && b.ctx.from == from)
                .count(),
        )
    }

    fn len(&self) -> usize {
        self.blocks.lock().len()
    }
}

// =============================================================================
// Lanes
// =============================================================================

/// One serial upload lane, drained by exactly one worker
struct Lane {
    queue: Mutex<VecDeque<StageBlock>>,
    /// Blocks available to the worker
    items: Semaphore,
    /// Remaining capacity; acquiring it is the backpressure gate
    space: Semaphore,
}

impl Lane {
    fn new(cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            items: Semaphore::new(0),
            space: Semaphore::new(cap),
        }
    }
}

// =============================================================================
// Uploader
// =============================================================================

/// Bounded two-stage upload pipeline for one disk cache
pub struct Uploader {
    cfg: UploaderConfig,
    object_store: ObjectStoreRef,
    fs: Arc<dyn LocalFs>,
    countdown: Arc<FlushCountdown>,
    metrics: Arc<DiskCacheMetrics>,
    store_prefix: String,
    drop_page_cache: bool,
    /// Owning store, for post-success stage removal. Weak: the store owns
    /// the submission side of this pipeline, not the other way around.
    store: Mutex<Option<Weak<dyn CacheStore>>>,
    running: AtomicBool,
    pending: PendingQueue,
    pending_notify: Notify,
    lanes: Vec<Arc<Lane>>,
    /// Blocks promoted out of pending and not yet completed
    uploading: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Uploader {
    pub fn new(
        cfg: UploaderConfig,
        object_store: ObjectStoreRef,
        fs: Arc<dyn LocalFs>,
        countdown: Arc<FlushCountdown>,
        metrics: Arc<DiskCacheMetrics>,
        store_prefix: String,
        drop_page_cache: bool,
    ) -> Arc<Self> {
        let lanes = (0..cfg.upload_workers.max(1))
            .map(|_| Arc::new(Lane::new(cfg.lane_cap())))
            .collect();

        Arc::new(Self {
            cfg,
            object_store,
            fs,
            countdown,
            metrics,
            store_prefix,
            drop_page_cache,
            store: Mutex::new(None),
            running: AtomicBool::new(false),
            pending: PendingQueue::default(),
            pending_notify: Notify::new(),
            lanes,
            uploading: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Wire the store whose `remove_stage` completes an upload
    pub fn bind_store(&self, store: &Arc<dyn CacheStore>) {
        *self.store.lock() = Some(Arc::downgrade(store));
    }

    /// Submission hook to hand to `CacheStore::init`
    pub fn upload_fn(self: &Arc<Self>) -> UploadFn {
        let uploader = Arc::clone(self);
        Arc::new(move |key, stage_path, ctx| uploader.submit(key, stage_path, ctx))
    }

    /// Enqueue one staged block. Synchronous and non-blocking.
    pub fn submit(&self, key: BlockKey, stage_path: PathBuf, ctx: BlockContext) {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        if ctx.from == BlockFrom::CtoFlush {
            self.countdown.add(key.ino, 1, false);
        }
        self.pending.push(StageBlock {
            seq,
            key,
            stage_path,
            ctx,
        });
        self.pending_notify.notify_one();
    }

    /// Start the scan task and one worker per lane
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock();

        let uploader = Arc::clone(self);
        tasks.push(tokio::spawn(async move { uploader.scan_loop().await }));

        for lane_idx in 0..self.lanes.len() {
            let uploader = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                uploader.worker_loop(lane_idx).await;
            }));
        }
    }

    /// Drain in-flight work up to the configured deadline, then detach
    /// whatever is still running.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pending_notify.notify_waiters();

        let deadline = Duration::from_secs(self.cfg.drain_deadline_secs);
        if tokio::time::timeout(deadline, self.wait_all_uploaded())
            .await
            .is_err()
        {
            warn!(
                pending = self.pending.len(),
                uploading = self.uploading.load(Ordering::Relaxed),
                "upload drain deadline passed, detaching workers"
            );
        }

        for lane in &self.lanes {
            lane.items.close();
            lane.space.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("uploader stopped");
    }

    /// Suspend until both queues are empty and no upload is executing
    pub async fn wait_all_uploaded(&self) {
        loop {
            if self.pending.len() == 0 && self.uploading.load(Ordering::Relaxed) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Blocks promoted to the bounded side and not yet completed
    pub fn uploading_len(&self) -> usize {
        self.uploading.load(Ordering::Relaxed)
    }

    /// Blocks still waiting in the intake queue
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // =========================================================================
    // Scan task
    // =========================================================================

    /// Reserve half the bounded queue for synchronous flushes: background
    /// batches are admitted only below the reservation line.
    fn admit(&self, batch: &[StageBlock]) -> bool {
        match batch.first() {
            None => false,
            Some(head) if head.ctx.from == BlockFrom::CtoFlush => true,
            Some(_) => self.uploading.load(Ordering::Relaxed) < self.cfg.upload_queue_cap / 2,
        }
    }

    async fn scan_loop(self: Arc<Self>) {
        loop {
            let batch = self.pending.peek_batch();

            if batch.is_empty() {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let notified = self.pending_notify.notified();
                let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
                continue;
            }

            if !self.admit(&batch) {
                tokio::time::sleep(Duration::from_millis(self.cfg.scan_backoff_ms)).await;
                continue;
            }

            for block in self.pending.pop_batch() {
                let lane = Arc::clone(&self.lanes[self.lane_of(&block.key)]);
                if self.push_lane(&lane, block).await.is_err() {
                    return; // closed during shutdown
                }
            }
        }
    }

    fn lane_of(&self, key: &BlockKey) -> usize {
        // FNV-1a over the slot identity; stable and cheap.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for value in [key.ino, key.chunk_id, key.index] {
            for byte in value.to_le_bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x1_0000_0000_01b3);
            }
        }
        (hash % self.lanes.len() as u64) as usize
    }

    async fn push_lane(&self, lane: &Lane, block: StageBlock) -> Result<(), ()> {
        let permit = lane.space.acquire().await.map_err(|_| ())?;
        permit.forget();
        lane.queue.lock().push_back(block);
        self.uploading.fetch_add(1, Ordering::Relaxed);
        lane.items.add_permits(1);
        Ok(())
    }

    // =========================================================================
    // Upload workers
    // =========================================================================

    async fn worker_loop(self: Arc<Self>, lane_idx: usize) {
        let lane = Arc::clone(&self.lanes[lane_idx]);
        loop {
            let permit = match lane.items.acquire().await {
                Ok(permit) => permit,
                Err(_) => break, // closed
            };
            permit.forget();

            let block = lane
                .queue
                .lock()
                .pop_front()
                .expect("lane queue empty with an item permit");

            self.upload_block(block).await;
            self.uploading.fetch_sub(1, Ordering::Relaxed);
            lane.space.add_permits(1);
        }
    }

    async fn upload_block(&self, block: StageBlock) {
        let started = Instant::now();

        let body = match self
            .fs
            .read_file(&block.stage_path, self.drop_page_cache)
            .await
        {
            Ok(body) => body,
            Err(CacheError::NotFound) => {
                // Deleted out from under us (GC or a racing remove); the
                // block no longer needs uploading.
                warn!(
                    key = %block.key,
                    path = %block.stage_path.display(),
                    "stage block already deleted, aborting upload"
                );
                self.complete(&block, false);
                return;
            }
            Err(err) => {
                error!(
                    key = %block.key,
                    path = %block.stage_path.display(),
                    error = %err,
                    "failed to read stage block, aborting upload"
                );
                self.complete(&block, false);
                return;
            }
        };

        let store_key = block.key.store_key(&self.store_prefix);
        let mut attempt: u32 = 0;
        loop {
            match self.object_store.put(&store_key, body.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    self.metrics.record_upload_retry();
                    warn!(
                        key = %block.key,
                        attempt,
                        error = %err,
                        "object store put failed, retrying"
                    );
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        self.remove_staged(&block).await;
        self.metrics.record_uploaded(body.len() as u64);
        debug!(
            key = %block.key,
            size = body.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "uploaded stage block"
        );
        self.complete(&block, true);
    }

    /// Best-effort removal of the uploaded stage file through the store,
    /// so stage accounting is released along with the file.
    async fn remove_staged(&self, block: &StageBlock) {
        let store = self.store.lock().clone();
        match store.and_then(|weak| weak.upgrade()) {
            Some(store) => {
                if let Err(err) = store.remove_stage(&block.key, block.ctx).await {
                    warn!(
                        key = %block.key,
                        error = %err,
                        "failed to remove stage block after upload"
                    );
                }
            }
            None => {
                // Store already torn down; the next restart's loader will
                // re-upload and then remove the file.
                warn!(key = %block.key, "store gone, leaving stage file for rescan");
            }
        }
    }

    fn complete(&self, block: &StageBlock, success: bool) {
        if block.ctx.from == BlockFrom::CtoFlush {
            self.countdown.add(block.key.ino, -1, !success);
        }
    }
}
