//! Filesystem activity tracking for the idle-timeout monitor.
//!
//! Every operation callback bumps a lock-free usage counter; open handles
//! are counted so an idle-looking session with files still open is never
//! unmounted out from under them. The monitor samples this state once per
//! poll cycle through an [`IdleGauge`], which turns raw counters into a
//! consecutive-idle-cycle count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// Thread-safe activity counters for a mounted session.
///
/// Counter updates use relaxed atomics: the monitor only needs eventual
/// consistency, and a poll cycle is ten seconds long.
#[derive(Debug)]
pub struct FsActivity {
    /// Monotonic count of operations serviced.
    usage: AtomicU64,
    /// Currently open file handles.
    open_files: AtomicU64,
    /// Currently open directory handles.
    open_dirs: AtomicU64,
    /// Timestamp of the most recent operation.
    last_activity: RwLock<Instant>,
}

impl Default for FsActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl FsActivity {
    /// Creates a tracker with zeroed counters.
    pub fn new() -> Self {
        Self {
            usage: AtomicU64::new(0),
            open_files: AtomicU64::new(0),
            open_dirs: AtomicU64::new(0),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Records one serviced operation.
    #[inline]
    pub fn record_op(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.write() = Instant::now();
    }

    /// Records a file handle being opened.
    #[inline]
    pub fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a file handle being released.
    #[inline]
    pub fn file_released(&self) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a directory handle being opened.
    #[inline]
    pub fn dir_opened(&self) {
        self.open_dirs.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a directory handle being released.
    #[inline]
    pub fn dir_released(&self) {
        self.open_dirs.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current cumulative usage counter.
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Total open handles (files plus directories).
    pub fn open_handles(&self) -> u64 {
        self.open_files.load(Ordering::Relaxed) + self.open_dirs.load(Ordering::Relaxed)
    }

    /// Time since the last recorded operation.
    pub fn since_last_activity(&self) -> std::time::Duration {
        self.last_activity.read().elapsed()
    }
}

/// One sample produced by [`IdleGauge::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSample {
    /// Consecutive poll cycles with no usage-counter movement.
    pub idle_cycles: u64,
    /// Open handles at sample time.
    pub open_handles: u64,
}

/// Accumulates consecutive idle poll cycles from usage snapshots.
///
/// The cycle count resets whenever the usage counter moved since the last
/// poll or any handle is open, so `idle_cycles` only ever counts a run of
/// genuinely quiet cycles.
#[derive(Debug)]
pub struct IdleGauge {
    last_usage: u64,
    idle_cycles: u64,
}

impl Default for IdleGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleGauge {
    /// Creates a gauge with no accumulated cycles.
    pub fn new() -> Self {
        Self {
            last_usage: 0,
            idle_cycles: 0,
        }
    }

    /// Takes one poll sample against the given tracker.
    pub fn poll(&mut self, activity: &FsActivity) -> IdleSample {
        let usage = activity.usage();
        let open_handles = activity.open_handles();

        if usage == self.last_usage && open_handles == 0 {
            self.idle_cycles += 1;
        } else {
            self.idle_cycles = 0;
        }
        self.last_usage = usage;

        IdleSample {
            idle_cycles: self.idle_cycles,
            open_handles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_cycles_accumulate() {
        let activity = FsActivity::new();
        let mut gauge = IdleGauge::new();

        for expected in 1..=5 {
            let sample = gauge.poll(&activity);
            assert_eq!(sample.idle_cycles, expected);
            assert_eq!(sample.open_handles, 0);
        }
    }

    #[test]
    fn usage_movement_resets_the_count() {
        let activity = FsActivity::new();
        let mut gauge = IdleGauge::new();

        gauge.poll(&activity);
        gauge.poll(&activity);
        activity.record_op();
        assert_eq!(gauge.poll(&activity).idle_cycles, 0);
        assert_eq!(gauge.poll(&activity).idle_cycles, 1);
    }

    #[test]
    fn open_handles_hold_the_count_at_zero() {
        let activity = FsActivity::new();
        let mut gauge = IdleGauge::new();

        activity.file_opened();
        for _ in 0..3 {
            let sample = gauge.poll(&activity);
            assert_eq!(sample.idle_cycles, 0);
            assert_eq!(sample.open_handles, 1);
        }

        activity.file_released();
        assert_eq!(gauge.poll(&activity).idle_cycles, 1);
    }

    #[test]
    fn open_and_release_balance_out() {
        let activity = FsActivity::new();
        activity.file_opened();
        activity.dir_opened();
        assert_eq!(activity.open_handles(), 2);
        activity.file_released();
        activity.dir_released();
        assert_eq!(activity.open_handles(), 0);
    }
}
