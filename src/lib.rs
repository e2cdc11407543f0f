//! DingoFS Client Block Cache
//!
//! The client-side block cache sits between the filesystem data path and
//! an S3-compatible object store. It plays two roles at once: a write
//! staging layer that makes new blocks durable on local disk and uploads
//! them asynchronously, and a read cache that serves content-addressed
//! blocks from local files with LRU eviction under a disk budget.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         BlockCacheEngine                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────┐   ┌───────────────────────────┐  │
//! │  │        DiskCacheGroup         │   │   Uploader (per disk)     │  │
//! │  │     (hash-routed facade)      │   │  pending ─▶ lanes ─▶ PUT  │  │
//! │  └──────┬───────────────┬────────┘   └──────────┬────────────────┘  │
//! │         │               │                       │                   │
//! │  ┌──────┴─────┐  ┌──────┴─────┐          ┌──────┴─────────┐         │
//! │  │ DiskCache  │  │ DiskCache  │   ...    │ FlushCountdown │         │
//! │  │ ┌────────┐ │  │            │          │ (per-inode     │         │
//! │  │ │Manager │ │  │            │          │  in-flight)    │         │
//! │  │ │Loader  │ │  │            │          └────────────────┘         │
//! │  │ │Health  │ │  │            │                                     │
//! │  │ └────────┘ │  │            │                                     │
//! │  └────────────┘  └────────────┘                                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   LocalFs port (stage/ + cache/ trees, hard-link coupling)          │
//! │   ObjectStore port (S3-compatible remote)                           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A staged block is written under `stage/`, hard-linked into `cache/` so
//! it is immediately readable, and handed to the uploader; `stage` returns
//! before the upload completes. Writers that need remote durability call
//! `wait_flush(ino)`, which blocks until every synchronously staged block
//! of the inode has been PUT. On startup a loader rescans both trees, so
//! blocks orphaned by a crash are re-uploaded and pre-existing cache files
//! come back into the LRU.
//!
//! # Usage
//!
//! ```ignore
//! use dingo_blockcache::{
//!     Block, BlockCacheConfig, BlockCacheEngine, BlockContext, BlockKey, PosixFs,
//! };
//!
//! let config = BlockCacheConfig::single_disk("/var/cache/dingofs");
//! let engine = BlockCacheEngine::new(config, object_store, PosixFs::new());
//! engine.init().await?;
//!
//! let key = BlockKey::new(fs_id, ino, chunk_id, index, version);
//! engine.stage(&key, Block::new(body), BlockContext::cto_flush()).await?;
//! engine.wait_flush(ino).await?; // remote durability
//!
//! let reader = engine.load(&key).await?;
//! let bytes = reader.read_at(0, 4096)?;
//! ```

pub mod block;
pub mod config;
pub mod countdown;
pub mod disk;
pub mod error;
pub mod fs;
pub mod health;
pub mod layout;
pub mod loader;
pub mod manager;
pub mod mem;
pub mod metrics;
pub mod object_store;
pub mod store;
pub mod uploader;

pub use block::{Block, BlockContext, BlockFrom, BlockKey, CacheValue, StageBlock};
pub use config::{BlockCacheConfig, DiskCacheConfig, HealthConfig, UploaderConfig};
pub use countdown::FlushCountdown;
pub use disk::{BlockReader, DiskCache};
pub use error::{CacheError, Result};
pub use fs::{FileStat, HealthWatchedFs, LocalFs, PosixFs};
pub use health::{DiskHealth, DiskState};
pub use layout::DiskLayout;
pub use loader::DiskCacheLoader;
pub use manager::DiskCacheManager;
pub use mem::MemStore;
pub use metrics::{DiskCacheMetrics, MetricsSnapshot};
pub use object_store::{MemObjectStore, ObjectStore, ObjectStoreRef};
pub use store::{BlockCacheEngine, DiskCacheGroup};
pub use uploader::Uploader;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Submission hook handed to a store at `init`: enqueues a freshly staged
/// (or rediscovered) block into the upload pipeline. Never blocks on the
/// network.
pub type UploadFn = Arc<dyn Fn(BlockKey, PathBuf, BlockContext) + Send + Sync>;

// =============================================================================
// CacheStore Port
// =============================================================================

/// Port for a block store: one disk, a routed group of disks, or the
/// memory-only variant.
///
/// All methods are safe to call concurrently. `stage` promises durability
/// to local disk plus eventual upload, not durability in the object store;
/// callers needing the latter use the flush-wait path on the engine.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Bring the store up. Idempotent.
    async fn init(&self, upload_fn: UploadFn) -> Result<()>;

    /// Take the store down. Completes in bounded time even with uploads in
    /// flight.
    async fn shutdown(&self) -> Result<()>;

    /// Write a block to the stage tree, mirror it into the cache tree, and
    /// enqueue it for upload. Returns before the upload completes.
    async fn stage(&self, key: &BlockKey, block: Block, ctx: BlockContext) -> Result<()>;

    /// Remove a block's stage file. Works even when the store is down or
    /// unhealthy (upload completion and GC both land here) and tolerates
    /// the file being already gone.
    async fn remove_stage(&self, key: &BlockKey, ctx: BlockContext) -> Result<()>;

    /// Write a read-only cache entry, without staging
    async fn cache(&self, key: &BlockKey, block: Block) -> Result<()>;

    /// Open a locally cached block for reading. `NotFound` is a normal
    /// outcome; the caller falls back to the object store.
    async fn load(&self, key: &BlockKey) -> Result<BlockReader>;

    /// Fast membership predicate; never opens files
    fn is_cached(&self, key: &BlockKey) -> bool;

    /// Stable identity of the store
    fn id(&self) -> String;
}

/// Shared handle to a cache store
pub type CacheStoreRef = Arc<dyn CacheStore>;
