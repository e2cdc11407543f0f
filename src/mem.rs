//! Memory-Only Store Variant
//!
//! Stands in for the disk cache when no cache directory is configured:
//! the same port, with every data operation answering `NotSupported` so
//! callers fall through to the object store. Lifecycle calls are no-ops.

use crate::block::{Block, BlockContext, BlockKey};
use crate::disk::BlockReader;
use crate::error::{CacheError, Result};
use crate::{CacheStore, UploadFn};
use async_trait::async_trait;
use std::sync::Arc;

/// Cache-off [`CacheStore`]
#[derive(Debug, Default)]
pub struct MemStore;

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CacheStore for MemStore {
    async fn init(&self, _upload_fn: UploadFn) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn stage(&self, _key: &BlockKey, _block: Block, _ctx: BlockContext) -> Result<()> {
        Err(CacheError::NotSupported)
    }

    async fn remove_stage(&self, _key: &BlockKey, _ctx: BlockContext) -> Result<()> {
        Err(CacheError::NotSupported)
    }

    async fn cache(&self, _key: &BlockKey, _block: Block) -> Result<()> {
        Err(CacheError::NotSupported)
    }

    async fn load(&self, _key: &BlockKey) -> Result<BlockReader> {
        Err(CacheError::NotSupported)
    }

    fn is_cached(&self, _key: &BlockKey) -> bool {
        false
    }

    fn id(&self) -> String {
        "memory-store".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_everything_is_unsupported() {
        let store = MemStore::new();
        let key = BlockKey::new(1, 2, 3, 4, 5);

        store.init(Arc::new(|_, _, _| {})).await.unwrap();

        assert!(matches!(
            store
                .stage(&key, Block::copy_from_slice(b"x"), BlockContext::writeback())
                .await
                .unwrap_err(),
            CacheError::NotSupported
        ));
        assert!(matches!(
            store
                .remove_stage(&key, BlockContext::writeback())
                .await
                .unwrap_err(),
            CacheError::NotSupported
        ));
        assert!(matches!(
            store
                .cache(&key, Block::copy_from_slice(b"x"))
                .await
                .unwrap_err(),
            CacheError::NotSupported
        ));
        assert!(matches!(
            store.load(&key).await.unwrap_err(),
            CacheError::NotSupported
        ));
        assert!(!store.is_cached(&key));
        assert_eq!(store.id(), "memory-store");

        store.shutdown().await.unwrap();
    }
}
