//! Error types for the block cache
//!
//! One crate-wide error enum covering admission outcomes, filesystem
//! failures, and upload failures. Admission errors (`CacheDown`,
//! `CacheUnhealthy`, `CacheFull`) are ordinary control-flow results for
//! callers: a full or unhealthy disk means "write through to the object
//! store instead", not "abort".

use thiserror::Error;

/// Unified error type for the block cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Block, file, or LRU entry is absent. A normal outcome on the read
    /// path: the caller falls back to the object store.
    #[error("not found")]
    NotFound,

    /// The target disk cache is not running.
    #[error("cache is down")]
    CacheDown,

    /// The disk's health state forbids new work.
    #[error("cache is unhealthy")]
    CacheUnhealthy,

    /// Admission rejected the operation due to a capacity cap.
    #[error("cache is full")]
    CacheFull,

    /// The store variant does not implement this operation
    /// (e.g. staging against the memory-only store).
    #[error("operation not supported")]
    NotSupported,

    /// A name under `stage/` or `cache/` does not match the block
    /// filename grammar.
    #[error("invalid block file name: {0}")]
    InvalidFileName(String),

    /// At least one block staged for the inode could not be persisted to
    /// the object store.
    #[error("upload failed for at least one block of inode {ino}")]
    UploadFailed { ino: u64 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Check whether this is the benign miss outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    /// Check whether this error came out of the admission gate rather
    /// than an actual I/O failure.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            CacheError::CacheDown | CacheError::CacheUnhealthy | CacheError::CacheFull
        )
    }
}

/// Result type alias for the block cache
pub type Result<T> = std::result::Result<T, CacheError>;

/// Map an `std::io::Error` to the cache taxonomy, folding `NotFound`
/// into the dedicated variant.
pub(crate) fn from_io(err: std::io::Error) -> CacheError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CacheError::NotFound
    } else {
        CacheError::Io(err)
    }
}
