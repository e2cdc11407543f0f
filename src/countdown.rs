//! Per-Inode In-Flight Counting
//!
//! A flush must not return until every synchronously staged block of its
//! inode is durable in the object store. [`FlushCountdown`] keeps one
//! counter per inode: the uploader increments on enqueue of a `CtoFlush`
//! block and decrements on completion, flagging failures; `wait` suspends
//! until the counter reaches zero and reports whether any contributing
//! block failed.

use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Slot {
    count: i64,
    failed: bool,
}

/// Per-inode in-flight counters with async wait-for-zero
#[derive(Default)]
pub struct FlushCountdown {
    slots: Mutex<HashMap<u64, Slot>>,
    notify: Notify,
}

impl FlushCountdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adjust the counter for `ino` by `n`, recording a failure if
    /// `failed` is set. A failure sticks to the inode until a waiter
    /// consumes it, so a flush that arrives after the last failed block
    /// completed still observes it.
    pub fn add(&self, ino: u64, n: i64, failed: bool) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(ino).or_default();
        slot.count += n;
        if failed {
            slot.failed = true;
        }

        debug_assert!(slot.count >= 0, "in-flight counter went negative");

        if slot.count <= 0 {
            if !slot.failed {
                slots.remove(&ino);
            }
            drop(slots);
            self.notify.notify_waiters();
        }
    }

    /// Current in-flight count for `ino`
    pub fn count(&self, ino: u64) -> i64 {
        self.slots.lock().get(&ino).map(|s| s.count).unwrap_or(0)
    }

    /// Suspend until the counter for `ino` reaches zero. Returns an error
    /// if any block counted against the inode failed; the failure flag is
    /// consumed by this call.
    pub async fn wait(&self, ino: u64) -> Result<()> {
        loop {
            // Register interest before inspecting state so a completion
            // between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.slots.lock();
                match slots.get(&ino) {
                    None => return Ok(()),
                    Some(slot) if slot.count <= 0 => {
                        let failed = slot.failed;
                        slots.remove(&ino);
                        return if failed {
                            Err(CacheError::UploadFailed { ino })
                        } else {
                            Ok(())
                        };
                    }
                    Some(_) => {}
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_with_nothing_in_flight() {
        let countdown = FlushCountdown::new();
        countdown.wait(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_zero() {
        let countdown = FlushCountdown::new();
        countdown.add(7, 1, false);
        countdown.add(7, 1, false);

        let waiter = {
            let countdown = Arc::clone(&countdown);
            tokio::spawn(async move { countdown.wait(7).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        countdown.add(7, -1, false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        countdown.add(7, -1, false);
        waiter.await.unwrap().unwrap();
        assert_eq!(countdown.count(7), 0);
    }

    #[tokio::test]
    async fn test_failure_is_aggregated_and_consumed() {
        let countdown = FlushCountdown::new();
        countdown.add(3, 1, false);
        countdown.add(3, 1, false);
        countdown.add(3, -1, true); // one block failed
        countdown.add(3, -1, false);

        let err = countdown.wait(3).await.unwrap_err();
        assert!(matches!(err, CacheError::UploadFailed { ino: 3 }));

        // The failure was consumed; the next flush starts clean.
        countdown.wait(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_inodes_are_independent() {
        let countdown = FlushCountdown::new();
        countdown.add(1, 1, false);
        countdown.add(2, 1, false);
        countdown.add(2, -1, false);

        // Inode 2 is drained even though inode 1 is still in flight.
        countdown.wait(2).await.unwrap();
        assert_eq!(countdown.count(1), 1);

        countdown.add(1, -1, false);
        countdown.wait(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_many_concurrent_waiters() {
        let countdown = FlushCountdown::new();
        countdown.add(9, 1, false);

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let countdown = Arc::clone(&countdown);
                tokio::spawn(async move { countdown.wait(9).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        countdown.add(9, -1, false);

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }
}
