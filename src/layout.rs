//! On-Disk Layout
//!
//! Path derivation for a single disk cache root. The layout is:
//!
//! ```text
//! <root>/
//!   lock      uuid text, the disk's stable identity
//!   detect    transient direct-I/O probe file
//!   stage/    staged block bodies awaiting upload
//!   cache/    read-side mirror, hard-linked to stage/ where possible
//!   probe/    disposable files written by the health prober
//! ```

use crate::block::BlockKey;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "lock";
const DETECT_FILE: &str = "detect";
const STAGE_DIR: &str = "stage";
const CACHE_DIR: &str = "cache";
const PROBE_DIR: &str = "probe";

/// Path derivation for one disk cache root
#[derive(Debug, Clone)]
pub struct DiskLayout {
    root: PathBuf,
}

impl DiskLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.root.join(STAGE_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn probe_dir(&self) -> PathBuf {
        self.root.join(PROBE_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn detect_path(&self) -> PathBuf {
        self.root.join(DETECT_FILE)
    }

    pub fn stage_path(&self, key: &BlockKey) -> PathBuf {
        self.stage_dir().join(key.filename())
    }

    pub fn cache_path(&self, key: &BlockKey) -> PathBuf {
        self.cache_dir().join(key.filename())
    }

    /// Every directory `init` must create, root first
    pub fn dirs(&self) -> Vec<PathBuf> {
        vec![
            self.root.clone(),
            self.stage_dir(),
            self.cache_dir(),
            self.probe_dir(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = DiskLayout::new("/data/disk0");
        let key = BlockKey::new(1, 2, 3, 4, 5);

        assert_eq!(layout.lock_path(), PathBuf::from("/data/disk0/lock"));
        assert_eq!(layout.detect_path(), PathBuf::from("/data/disk0/detect"));
        assert_eq!(
            layout.stage_path(&key),
            PathBuf::from("/data/disk0/stage/1_2_3_4_5")
        );
        assert_eq!(
            layout.cache_path(&key),
            PathBuf::from("/data/disk0/cache/1_2_3_4_5")
        );
        assert_eq!(layout.dirs().len(), 4);
    }

    #[test]
    fn test_stage_and_cache_share_filename() {
        let layout = DiskLayout::new("/d");
        let key = BlockKey::new(9, 8, 7, 6, 5);
        assert_eq!(
            layout.stage_path(&key).file_name(),
            layout.cache_path(&key).file_name()
        );
    }
}
