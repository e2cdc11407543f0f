//! Block Identity and Pipeline Types
//!
//! Defines block keys with their on-disk filename grammar, block bodies,
//! the scheduling context carried through the upload pipeline, and the
//! LRU payload tracked per cache file.

use crate::error::{CacheError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Block Key
// =============================================================================

/// Content-addressed identifier of a block body.
///
/// Keys are immutable and value-compared. The same key names the block in
/// three places: the `stage/` tree, the `cache/` tree (both via
/// [`BlockKey::filename`]) and the object store (via [`BlockKey::store_key`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    /// Filesystem id
    pub fs_id: u32,
    /// Inode the block belongs to
    pub ino: u64,
    /// Chunk within the inode
    pub chunk_id: u64,
    /// Block index within the chunk
    pub index: u64,
    /// Write version of this (chunk, index) slot
    pub version: u64,
}

impl BlockKey {
    /// Create a new block key
    pub fn new(fs_id: u32, ino: u64, chunk_id: u64, index: u64, version: u64) -> Self {
        Self {
            fs_id,
            ino,
            chunk_id,
            index,
            version,
        }
    }

    /// Name used for the block on local disk, in both `stage/` and `cache/`
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.fs_id, self.ino, self.chunk_id, self.index, self.version
        )
    }

    /// Name used for the block in the object store
    pub fn store_key(&self, prefix: &str) -> String {
        format!("{}/{}", prefix, self.filename())
    }

    /// Parse a local filename back into a key.
    ///
    /// The grammar is strict: exactly five decimal fields separated by
    /// underscores, no leading zeros except for the value zero. Anything
    /// else is rejected so the loader never mistakes a stray file for a
    /// block.
    pub fn parse_filename(name: &str) -> Result<Self> {
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 5 {
            return Err(CacheError::InvalidFileName(name.to_string()));
        }

        let parse = |s: &str| -> Option<u64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            if s.len() > 1 && s.starts_with('0') {
                return None;
            }
            s.parse().ok()
        };

        let mut values = [0u64; 5];
        for (i, field) in fields.iter().enumerate() {
            values[i] = parse(field).ok_or_else(|| CacheError::InvalidFileName(name.to_string()))?;
        }

        let fs_id = u32::try_from(values[0])
            .map_err(|_| CacheError::InvalidFileName(name.to_string()))?;

        Ok(Self {
            fs_id,
            ino: values[1],
            chunk_id: values[2],
            index: values[3],
            version: values[4],
        })
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename())
    }
}

// =============================================================================
// Block
// =============================================================================

/// An in-memory block body.
///
/// No identity of its own; consumed by the single call it is passed to.
#[derive(Debug, Clone)]
pub struct Block {
    /// The block bytes
    pub data: Bytes,
}

impl Block {
    /// Create a block from owned bytes
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Create a block by copying a slice
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Block length in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

// =============================================================================
// Block Context
// =============================================================================

/// Where a staged block came from; drives upload scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockFrom {
    /// The writer is synchronously awaiting durability (close-to-open
    /// consistency). Bypasses upload admission fairness and is counted in
    /// the per-inode in-flight map.
    CtoFlush,
    /// Background writeback; yields to `CtoFlush` traffic.
    NoCtoFlush,
    /// Rediscovered on disk by the startup loader; its writer is gone.
    Reload,
}

/// Scheduling hint carried with a block from `stage` to upload completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    /// Origin of the block
    pub from: BlockFrom,
}

impl BlockContext {
    /// Context for a block staged by a synchronous flush
    pub fn cto_flush() -> Self {
        Self {
            from: BlockFrom::CtoFlush,
        }
    }

    /// Context for a background writeback block
    pub fn writeback() -> Self {
        Self {
            from: BlockFrom::NoCtoFlush,
        }
    }

    /// Context for a block rediscovered by the loader
    pub fn reload() -> Self {
        Self {
            from: BlockFrom::Reload,
        }
    }
}

// =============================================================================
// Stage Block
// =============================================================================

/// A unit of work in the upload pipeline.
#[derive(Debug, Clone)]
pub struct StageBlock {
    /// Monotonic sequence injected at enqueue time; the sole ordering
    /// tie-breaker within an upload lane.
    pub seq: u64,
    /// Identity of the staged block
    pub key: BlockKey,
    /// Absolute path of the stage file holding the body
    pub stage_path: std::path::PathBuf,
    /// Scheduling context
    pub ctx: BlockContext,
}

// =============================================================================
// Cache Value
// =============================================================================

/// LRU payload: one per live cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheValue {
    /// File size in bytes
    pub size: u64,
    /// Last access time
    pub atime: DateTime<Utc>,
}

impl CacheValue {
    /// Create a value with the access time set to now
    pub fn new(size: u64) -> Self {
        Self {
            size,
            atime: Utc::now(),
        }
    }

    /// Create a value with an explicit access time (loader ingest uses the
    /// file mtime)
    pub fn with_atime(size: u64, atime: DateTime<Utc>) -> Self {
        Self { size, atime }
    }

    /// Seconds since the last access
    pub fn idle_secs(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.atime)
            .num_seconds()
            .max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_round_trip() {
        let key = BlockKey::new(1, 20, 300, 4, 5);
        assert_eq!(key.filename(), "1_20_300_4_5");

        let parsed = BlockKey::parse_filename("1_20_300_4_5").unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_filename_zero_fields() {
        let key = BlockKey::new(0, 0, 0, 0, 0);
        assert_eq!(key.filename(), "0_0_0_0_0");
        assert_eq!(BlockKey::parse_filename("0_0_0_0_0").unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for name in [
            "",
            "1_2_3_4",          // too few fields
            "1_2_3_4_5_6",      // too many fields
            "1_2_3_4_x",        // non-decimal
            "01_2_3_4_5",       // leading zero
            "1_2_3_4_05",       // leading zero
            "1__3_4_5",         // empty field
            "-1_2_3_4_5",       // sign
            "1_2_3_4_5 ",       // trailing space
            "a1_2_3_4_5",       // prefix junk
            "1_2_3_4_99999999999999999999", // overflow
        ] {
            assert!(
                matches!(
                    BlockKey::parse_filename(name),
                    Err(CacheError::InvalidFileName(_))
                ),
                "expected rejection of {:?}",
                name
            );
        }
    }

    #[test]
    fn test_parse_rejects_fs_id_overflow() {
        // fs_id is u32; a value past it must be rejected even though the
        // field itself is valid decimal.
        assert!(BlockKey::parse_filename("4294967296_1_1_1_1").is_err());
        assert!(BlockKey::parse_filename("4294967295_1_1_1_1").is_ok());
    }

    #[test]
    fn test_store_key_prefix() {
        let key = BlockKey::new(1, 2, 3, 4, 5);
        assert_eq!(key.store_key("blocks"), "blocks/1_2_3_4_5");
    }

    #[test]
    fn test_block_size() {
        let block = Block::copy_from_slice(b"hello");
        assert_eq!(block.size(), 5);
    }

    #[test]
    fn test_cache_value_idle() {
        let old = CacheValue::with_atime(10, Utc::now() - chrono::Duration::seconds(120));
        assert!(old.idle_secs() >= 119);

        let fresh = CacheValue::new(10);
        assert!(fresh.idle_secs() <= 1);
    }
}
