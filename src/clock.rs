//! Clock rebasing.
//!
//! A restored target must not observe the time spent between the checkpoint
//! and the restore. Every target-visible clock read goes through
//! [`Clock::rebase`], which subtracts that gap once both ends are known.
//!
//! Nothing in here may log or allocate: the readers sit on the same hot path
//! as coverage logging and tracing.

use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicI64, Ordering};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Checkpoint/restore timestamps of one process, 0 means unset.
#[derive(Debug, Default)]
pub struct Clock {
    checkpoint_time: AtomicI64,
    restore_time: AtomicI64,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            checkpoint_time: AtomicI64::new(0),
            restore_time: AtomicI64::new(0),
        }
    }

    /// Hide the checkpoint/restore gap from `t`.
    #[inline]
    pub fn rebase(&self, t: i64) -> i64 {
        t - self.offset()
    }

    /// Current gap, 0 until both timestamps are recorded.
    #[inline]
    pub fn offset(&self) -> i64 {
        let checkpoint = self.checkpoint_time.load(Ordering::Acquire);
        let restore = self.restore_time.load(Ordering::Acquire);
        if checkpoint != 0 && restore != 0 {
            restore - checkpoint
        } else {
            0
        }
    }

    /// Rebased monotonic time in nanoseconds.
    #[inline]
    pub fn monotonic(&self) -> i64 {
        self.rebase(raw_monotonic())
    }

    /// Rebased wall clock time in nanoseconds.
    #[inline]
    pub fn realtime(&self) -> i64 {
        self.rebase(raw_realtime())
    }

    /// Record the instant of state capture. Only the first call counts.
    pub fn mark_checkpoint(&self) -> i64 {
        Self::mark_once(&self.checkpoint_time)
    }

    /// Record the instant execution resumed in a restored copy. Only the first call counts.
    pub fn mark_restore(&self) -> i64 {
        Self::mark_once(&self.restore_time)
    }

    pub fn checkpoint_time(&self) -> i64 {
        self.checkpoint_time.load(Ordering::Acquire)
    }

    pub fn restore_time(&self) -> i64 {
        self.restore_time.load(Ordering::Acquire)
    }

    fn mark_once(slot: &AtomicI64) -> i64 {
        // same source as `monotonic`, keeps the offset exact.
        let now = raw_monotonic();
        match slot.compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => now,
            Err(prev) => prev,
        }
    }
}

/// Host monotonic clock, not rebased.
#[inline]
pub fn raw_monotonic() -> i64 {
    read(ClockId::CLOCK_MONOTONIC)
}

/// Host wall clock, not rebased.
#[inline]
pub fn raw_realtime() -> i64 {
    read(ClockId::CLOCK_REALTIME)
}

#[inline]
fn read(id: ClockId) -> i64 {
    match clock_gettime(id) {
        Ok(ts) => ts.tv_sec() as i64 * NANOS_PER_SEC + ts.tv_nsec() as i64,
        Err(_) => 0,
    }
}
