//! Local Filesystem Port
//!
//! The disk cache never touches syscalls directly: everything goes through
//! the [`LocalFs`] port so tests can substitute fakes and so every disk
//! I/O outcome can be fed to the health state machine by the
//! [`HealthWatchedFs`] wrapper.
//!
//! [`PosixFs`] is the production implementation. Writes go to a `.tmp`
//! sibling and are renamed into place, so a crashed write never leaves a
//! partial block visible under `stage/` or `cache/`.

use crate::error::{from_io, CacheError, Result};
use crate::health::DiskHealth;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Alignment required for direct writes; also the fallback-to-buffered
/// boundary for bodies that are not a multiple of it.
const DIRECT_IO_ALIGN: usize = 4096;

// =============================================================================
// Directory Entry
// =============================================================================

/// Stat subset returned by [`LocalFs::read_dir`]
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Plain file name, no directory components
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: DateTime<Utc>,
}

// =============================================================================
// LocalFs Port
// =============================================================================

/// Port for every on-host filesystem operation the cache performs
#[async_trait]
pub trait LocalFs: Send + Sync {
    /// Create a directory and all missing parents
    async fn mkdir_p(&self, path: &Path) -> Result<()>;

    /// Read a whole file. With `drop_page_cache` the implementation advises
    /// the OS to drop the file's page-cache pages after the read.
    async fn read_file(&self, path: &Path, drop_page_cache: bool) -> Result<Bytes>;

    /// Write a whole file atomically (temp file + rename). `direct`
    /// requests direct I/O when the filesystem supports it and the body is
    /// aligned; otherwise the write silently falls back to buffered I/O
    /// with an fsync.
    async fn write_file(&self, path: &Path, data: &[u8], direct: bool) -> Result<()>;

    /// Hard-link `src` to `dst`
    async fn hardlink(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Remove a file
    async fn unlink(&self, path: &Path) -> Result<()>;

    /// Check for existence without opening
    async fn exists(&self, path: &Path) -> bool;

    /// Size of a file in bytes
    async fn file_size(&self, path: &Path) -> Result<u64>;

    /// List the plain files of a directory (subdirectories are skipped)
    async fn read_dir(&self, path: &Path) -> Result<Vec<FileStat>>;

    /// Open a file for reading and hand back the descriptor
    async fn open_read(&self, path: &Path) -> Result<std::fs::File>;

    /// Probe whether the filesystem under `probe_path` accepts `O_DIRECT`
    /// (tmpfs does not). The probe file is created and removed.
    async fn supports_direct_io(&self, probe_path: &Path) -> bool;
}

// =============================================================================
// PosixFs
// =============================================================================

/// Production [`LocalFs`] backed by tokio::fs, with direct-I/O and
/// page-cache-advise paths dropping to blocking syscalls.
#[derive(Debug, Default)]
pub struct PosixFs;

impl PosixFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    /// Unique temp sibling, so concurrent writers of the same path never
    /// interleave inside one temp file. A crash leaves it behind with an
    /// unparseable name, which the startup scan ignores.
    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        PathBuf::from(name)
    }
}

#[async_trait]
impl LocalFs for PosixFs {
    async fn mkdir_p(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await.map_err(from_io)
    }

    async fn read_file(&self, path: &Path, drop_page_cache: bool) -> Result<Bytes> {
        if drop_page_cache {
            let path = path.to_path_buf();
            let data = tokio::task::spawn_blocking(move || read_and_drop(&path))
                .await
                .map_err(|e| CacheError::Internal(e.to_string()))?
                .map_err(from_io)?;
            return Ok(Bytes::from(data));
        }

        let data = tokio::fs::read(path).await.map_err(from_io)?;
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: &[u8], direct: bool) -> Result<()> {
        let tmp = Self::tmp_path(path);

        if direct && !data.is_empty() && data.len() % DIRECT_IO_ALIGN == 0 {
            let tmp_owned = tmp.clone();
            let body = data.to_vec();
            tokio::task::spawn_blocking(move || write_direct(&tmp_owned, &body))
                .await
                .map_err(|e| CacheError::Internal(e.to_string()))?
                .map_err(from_io)?;
        } else {
            let mut file = tokio::fs::File::create(&tmp).await.map_err(from_io)?;
            file.write_all(data).await.map_err(from_io)?;
            file.sync_all().await.map_err(from_io)?;
        }

        tokio::fs::rename(&tmp, path).await.map_err(from_io)
    }

    async fn hardlink(&self, src: &Path, dst: &Path) -> Result<()> {
        tokio::fs::hard_link(src, dst).await.map_err(from_io)
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await.map_err(from_io)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        let meta = tokio::fs::metadata(path).await.map_err(from_io)?;
        Ok(meta.len())
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<FileStat>> {
        let mut entries = tokio::fs::read_dir(path).await.map_err(from_io)?;
        let mut stats = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(from_io)? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue, // raced with a concurrent delete
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            stats.push(FileStat {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                mtime,
            });
        }

        Ok(stats)
    }

    async fn open_read(&self, path: &Path) -> Result<std::fs::File> {
        let file = tokio::fs::File::open(path).await.map_err(from_io)?;
        Ok(file.into_std().await)
    }

    async fn supports_direct_io(&self, probe_path: &Path) -> bool {
        let probe = probe_path.to_path_buf();
        tokio::task::spawn_blocking(move || probe_direct(&probe))
            .await
            .unwrap_or(false)
    }
}

/// Read a file and advise the kernel that its pages will not be needed.
fn read_and_drop(path: &Path) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // Advisory only; failure changes nothing about the read.
        unsafe {
            libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }
    }

    Ok(data)
}

/// Write a body with `O_DIRECT` through an aligned bounce buffer.
#[cfg(target_os = "linux")]
fn write_direct(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)?;

    // O_DIRECT needs an aligned source buffer; over-allocate and write from
    // the aligned subslice.
    let mut storage = vec![0u8; data.len() + DIRECT_IO_ALIGN];
    let misalign = storage.as_ptr() as usize & (DIRECT_IO_ALIGN - 1);
    let start = if misalign == 0 {
        0
    } else {
        DIRECT_IO_ALIGN - misalign
    };
    storage[start..start + data.len()].copy_from_slice(data);

    file.write_all(&storage[start..start + data.len()])?;
    file.sync_all()
}

#[cfg(not(target_os = "linux"))]
fn write_direct(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(target_os = "linux")]
fn probe_direct(path: &Path) -> bool {
    use std::os::unix::fs::OpenOptionsExt;

    let opened = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .custom_flags(libc::O_DIRECT)
        .open(path);

    match opened {
        Ok(file) => {
            drop(file);
            let _ = std::fs::remove_file(path);
            true
        }
        Err(_) => {
            let _ = std::fs::remove_file(path);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_direct(_path: &Path) -> bool {
    false
}

// =============================================================================
// HealthWatchedFs
// =============================================================================

/// [`LocalFs`] decorator that feeds every I/O outcome into the disk health
/// state machine. `NotFound` counts as a healthy outcome: absence is an
/// answer, not a fault.
pub struct HealthWatchedFs {
    inner: Arc<dyn LocalFs>,
    health: Arc<DiskHealth>,
}

impl HealthWatchedFs {
    pub fn new(inner: Arc<dyn LocalFs>, health: Arc<DiskHealth>) -> Arc<Self> {
        Arc::new(Self { inner, health })
    }

    fn sample<T>(&self, result: &Result<T>) {
        let ok = match result {
            Ok(_) => true,
            Err(err) => err.is_not_found(),
        };
        self.health.record_io(ok);
    }
}

#[async_trait]
impl LocalFs for HealthWatchedFs {
    async fn mkdir_p(&self, path: &Path) -> Result<()> {
        let result = self.inner.mkdir_p(path).await;
        self.sample(&result);
        result
    }

    async fn read_file(&self, path: &Path, drop_page_cache: bool) -> Result<Bytes> {
        let result = self.inner.read_file(path, drop_page_cache).await;
        self.sample(&result);
        result
    }

    async fn write_file(&self, path: &Path, data: &[u8], direct: bool) -> Result<()> {
        let result = self.inner.write_file(path, data, direct).await;
        self.sample(&result);
        result
    }

    async fn hardlink(&self, src: &Path, dst: &Path) -> Result<()> {
        let result = self.inner.hardlink(src, dst).await;
        self.sample(&result);
        result
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        let result = self.inner.unlink(path).await;
        self.sample(&result);
        result
    }

    async fn exists(&self, path: &Path) -> bool {
        // Metadata peek; not a meaningful health sample.
        self.inner.exists(path).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        let result = self.inner.file_size(path).await;
        self.sample(&result);
        result
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<FileStat>> {
        let result = self.inner.read_dir(path).await;
        self.sample(&result);
        result
    }

    async fn open_read(&self, path: &Path) -> Result<std::fs::File> {
        let result = self.inner.open_read(path).await;
        self.sample(&result);
        result
    }

    async fn supports_direct_io(&self, probe_path: &Path) -> bool {
        self.inner.supports_direct_io(probe_path).await
    }
}

// =============================================================================
// Fault-Injecting Fake (tests)
// =============================================================================

/// Test fake that forwards to an inner [`LocalFs`] until told to fail,
/// after which every mutating or reading call errors.
#[cfg(test)]
pub(crate) struct FlakyFs {
    inner: Arc<dyn LocalFs>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyFs {
    pub fn new(inner: Arc<dyn LocalFs>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected fault",
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl LocalFs for FlakyFs {
    async fn mkdir_p(&self, path: &Path) -> Result<()> {
        self.check()?;
        self.inner.mkdir_p(path).await
    }

    async fn read_file(&self, path: &Path, drop_page_cache: bool) -> Result<Bytes> {
        self.check()?;
        self.inner.read_file(path, drop_page_cache).await
    }

    async fn write_file(&self, path: &Path, data: &[u8], direct: bool) -> Result<()> {
        self.check()?;
        self.inner.write_file(path, data, direct).await
    }

    async fn hardlink(&self, src: &Path, dst: &Path) -> Result<()> {
        self.check()?;
        self.inner.hardlink(src, dst).await
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        self.check()?;
        self.inner.unlink(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        self.check()?;
        self.inner.file_size(path).await
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<FileStat>> {
        self.check()?;
        self.inner.read_dir(path).await
    }

    async fn open_read(&self, path: &Path) -> Result<std::fs::File> {
        self.check()?;
        self.inner.open_read(path).await
    }

    async fn supports_direct_io(&self, probe_path: &Path) -> bool {
        self.inner.supports_direct_io(probe_path).await
    }
}
