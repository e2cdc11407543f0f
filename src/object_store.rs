//! Object Store Port
//!
//! The remote side of the cache, abstracted to the two operations the
//! block path needs. The production implementation wraps the S3 SDK
//! elsewhere; [`MemObjectStore`] serves tests and local development.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Port for the S3-compatible remote store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object body under `key`. One attempt; the upload pipeline
    /// owns the retry policy.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read `length` bytes of an object starting at `offset`. Short reads
    /// at the object tail return the available suffix.
    async fn range_get(&self, key: &str, offset: u64, length: usize) -> Result<Bytes>;
}

/// Shared handle to an object store
pub type ObjectStoreRef = Arc<dyn ObjectStore>;

// =============================================================================
// In-Memory Object Store
// =============================================================================

/// In-memory [`ObjectStore`] with failure and latency injection
#[derive(Debug, Default)]
pub struct MemObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
    fail_puts: AtomicU32,
    put_delay_ms: AtomicU64,
    put_attempts: AtomicU64,
}

impl MemObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` put attempts fail
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Delay every put by `delay` (simulates a slow remote)
    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stored body for `key`, if any
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total put attempts, including failed ones
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let remaining = self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if remaining.is_ok() {
            return Err(CacheError::Internal(format!(
                "injected put failure for {key}"
            )));
        }

        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn range_get(&self, key: &str, offset: u64, length: usize) -> Result<Bytes> {
        let objects = self.objects.read();
        let body = objects.get(key).ok_or(CacheError::NotFound)?;

        let start = (offset as usize).min(body.len());
        let end = start.saturating_add(length).min(body.len());
        Ok(body.slice(start..end))
    }
}
