//! Disk Health State Machine
//!
//! Tracks one disk through {Normal, Unstable, Bad}. Only Normal admits new
//! stage/cache work; the other two fail admission with `CacheUnhealthy`
//! while deletes and already-open readers keep working.
//!
//! Two inputs drive the machine: every disk I/O outcome is sampled into a
//! fixed-length window (evaluated on a timer), and a prober periodically
//! writes, reads, and unlinks a synthetic file under `probe/`.
//!
//! ```text
//!            err rate > threshold                 probe fails N times
//!   Normal ─────────────────────▶ Unstable ─────────────────────▶ Bad
//!      ▲                             │                             │
//!      │     clean for M windows     │      probe succeeds K times │
//!      └─────────────────────────────┴─────────────────────────────┘
//! ```

use crate::config::HealthConfig;
use crate::fs::LocalFs;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Windows with fewer samples than this are ignored: a single failed call
/// in an otherwise idle window is not a trend.
const MIN_WINDOW_SAMPLES: u64 = 16;

// =============================================================================
// Disk State
// =============================================================================

/// Health state of one disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiskState {
    /// Full service
    Normal = 0,
    /// Error rate tripped; new work refused while the prober decides
    /// whether the disk is actually gone
    Unstable = 1,
    /// Probes failing; only the prober can bring it back
    Bad = 2,
}

impl DiskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DiskState::Normal,
            1 => DiskState::Unstable,
            _ => DiskState::Bad,
        }
    }
}

// =============================================================================
// Disk Health
// =============================================================================

/// Per-disk health machine plus its sample window and probe counters.
///
/// State reads are a single atomic load; transitions serialize on an
/// internal mutex.
pub struct DiskHealth {
    cfg: HealthConfig,
    state: AtomicU8,
    window_ok: AtomicU64,
    window_err: AtomicU64,
    clean_windows: AtomicU32,
    probe_fails: AtomicU32,
    probe_oks: AtomicU32,
    transition: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiskHealth {
    pub fn new(cfg: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: AtomicU8::new(DiskState::Normal as u8),
            window_ok: AtomicU64::new(0),
            window_err: AtomicU64::new(0),
            clean_windows: AtomicU32::new(0),
            probe_fails: AtomicU32::new(0),
            probe_oks: AtomicU32::new(0),
            transition: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current state (atomic read)
    pub fn state(&self) -> DiskState {
        DiskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether new stage/cache work may be admitted
    pub fn is_healthy(&self) -> bool {
        self.state() == DiskState::Normal
    }

    /// Feed one disk I/O outcome into the current sample window
    pub fn record_io(&self, ok: bool) {
        if ok {
            self.window_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.window_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close the current sample window and apply its verdict.
    /// Called on the sample-window cadence; public for tests.
    pub fn evaluate_window(&self) {
        let ok = self.window_ok.swap(0, Ordering::Relaxed);
        let err = self.window_err.swap(0, Ordering::Relaxed);
        let total = ok + err;

        let _guard = self.transition.lock();
        match self.state() {
            DiskState::Normal => {
                if total >= MIN_WINDOW_SAMPLES {
                    let rate = err as f64 / total as f64;
                    if rate > self.cfg.err_rate_threshold {
                        warn!(
                            err,
                            total,
                            rate,
                            "disk I/O error rate tripped, marking unstable"
                        );
                        self.clean_windows.store(0, Ordering::Relaxed);
                        self.set_state(DiskState::Unstable);
                    }
                }
            }
            DiskState::Unstable => {
                if err == 0 {
                    let clean = self.clean_windows.fetch_add(1, Ordering::Relaxed) + 1;
                    if clean >= self.cfg.recover_window {
                        info!(clean, "disk clean again, marking normal");
                        self.set_state(DiskState::Normal);
                    }
                } else {
                    self.clean_windows.store(0, Ordering::Relaxed);
                }
            }
            // Only the prober recovers a Bad disk.
            DiskState::Bad => {}
        }
    }

    /// Feed one probe outcome
    pub fn record_probe(&self, ok: bool) {
        let _guard = self.transition.lock();
        if ok {
            self.probe_fails.store(0, Ordering::Relaxed);
            let oks = self.probe_oks.fetch_add(1, Ordering::Relaxed) + 1;
            if self.state() == DiskState::Bad && oks >= self.cfg.probe_ok_threshold {
                info!(oks, "probes succeeding, marking normal");
                self.clean_windows.store(0, Ordering::Relaxed);
                self.set_state(DiskState::Normal);
            }
        } else {
            self.probe_oks.store(0, Ordering::Relaxed);
            let fails = self.probe_fails.fetch_add(1, Ordering::Relaxed) + 1;
            if self.state() == DiskState::Unstable && fails >= self.cfg.probe_fail_threshold {
                warn!(fails, "probes failing, marking bad");
                self.set_state(DiskState::Bad);
            }
        }
    }

    fn set_state(&self, state: DiskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Start the sample-window timer and the prober.
    ///
    /// The prober writes through the raw filesystem, not the watched
    /// wrapper: probe outcomes feed `record_probe`, not the sample window.
    pub fn start(self: &Arc<Self>, probe_dir: PathBuf, fs: Arc<dyn LocalFs>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let health = Arc::clone(self);
        let window = Duration::from_millis(self.cfg.sample_window_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                health.evaluate_window();
            }
        }));

        let health = Arc::clone(self);
        let interval = Duration::from_millis(self.cfg.probe_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ok = run_probe(&probe_dir, fs.as_ref()).await;
                debug!(ok, "disk probe");
                health.record_probe(ok);
            }
        }));
    }

    /// Stop the timers. The state itself is retained.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for DiskHealth {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One write/read/unlink cycle under `probe/`
async fn run_probe(probe_dir: &std::path::Path, fs: &dyn LocalFs) -> bool {
    let path = probe_dir.join(format!("probe_{}", uuid::Uuid::new_v4()));

    if fs.write_file(&path, b"probe", false).await.is_err() {
        return false;
    }
    let read_ok = matches!(fs.read_file(&path, false).await, Ok(body) if body.as_ref() == b"probe");
    let unlink_ok = fs.unlink(&path).await.is_ok();

    read_ok && unlink_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FlakyFs, PosixFs};
    use tempfile::TempDir;

    fn quick_cfg() -> HealthConfig {
        HealthConfig {
            probe_interval_ms: 20,
            sample_window_ms: 20,
            err_rate_threshold: 0.1,
            probe_fail_threshold: 2,
            probe_ok_threshold: 2,
            recover_window: 2,
        }
    }

    fn feed(health: &DiskHealth, ok: u64, err: u64) {
        for _ in 0..ok {
            health.record_io(true);
        }
        for _ in 0..err {
            health.record_io(false);
        }
    }

    #[test]
    fn test_error_rate_trips_unstable() {
        let health = DiskHealth::new(quick_cfg());
        assert_eq!(health.state(), DiskState::Normal);

        feed(&health, 10, 10);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Unstable);
    }

    #[test]
    fn test_small_windows_are_ignored() {
        let health = DiskHealth::new(quick_cfg());

        // High rate but too few samples to mean anything.
        feed(&health, 1, 3);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Normal);
    }

    #[test]
    fn test_unstable_recovers_after_clean_windows() {
        let health = DiskHealth::new(quick_cfg());
        feed(&health, 10, 10);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Unstable);

        // One clean window is not enough with recover_window = 2.
        feed(&health, 5, 0);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Unstable);

        feed(&health, 5, 0);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Normal);
    }

    #[test]
    fn test_dirty_window_resets_recovery() {
        let health = DiskHealth::new(quick_cfg());
        feed(&health, 10, 10);
        health.evaluate_window();

        feed(&health, 5, 0);
        health.evaluate_window();
        feed(&health, 5, 1);
        health.evaluate_window(); // resets the clean streak
        feed(&health, 5, 0);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Unstable);

        feed(&health, 5, 0);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Normal);
    }

    #[test]
    fn test_probe_failures_trip_bad_and_probe_recovers() {
        let health = DiskHealth::new(quick_cfg());
        feed(&health, 10, 10);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Unstable);

        health.record_probe(false);
        assert_eq!(health.state(), DiskState::Unstable);
        health.record_probe(false);
        assert_eq!(health.state(), DiskState::Bad);

        // Clean sample windows do not rescue a Bad disk.
        feed(&health, 20, 0);
        health.evaluate_window();
        assert_eq!(health.state(), DiskState::Bad);

        health.record_probe(true);
        assert_eq!(health.state(), DiskState::Bad);
        health.record_probe(true);
        assert_eq!(health.state(), DiskState::Normal);
    }

    #[test]
    fn test_probe_failures_in_normal_do_not_trip_bad() {
        let health = DiskHealth::new(quick_cfg());
        health.record_probe(false);
        health.record_probe(false);
        health.record_probe(false);
        assert_eq!(health.state(), DiskState::Normal);
    }

    #[tokio::test]
    async fn test_prober_round_trip_on_real_disk() {
        let tmp = TempDir::new().unwrap();
        assert!(run_probe(tmp.path(), PosixFs::new().as_ref()).await);

        // Leftover probe files are removed.
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_prober_detects_faulty_disk() {
        let tmp = TempDir::new().unwrap();
        let flaky = FlakyFs::new(PosixFs::new());
        flaky.set_failing(true);
        assert!(!run_probe(tmp.path(), flaky.as_ref()).await);
    }

    #[tokio::test]
    async fn test_started_prober_drives_recovery() {
        let tmp = TempDir::new().unwrap();
        let health = DiskHealth::new(quick_cfg());

        // Force Bad, then let the real prober walk it back to Normal.
        feed(&health, 10, 10);
        health.evaluate_window();
        health.record_probe(false);
        health.record_probe(false);
        assert_eq!(health.state(), DiskState::Bad);

        health.start(tmp.path().to_path_buf(), PosixFs::new());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(health.state(), DiskState::Normal);
        health.stop();
    }
}
