//! The idle-timeout monitor.
//!
//! A background thread that races against live filesystem activity: once
//! the session has been idle for the configured number of consecutive poll
//! cycles with zero open handles, it asks the host environment to unmount
//! the mount point, which makes the blocking dispatch loop return.
//!
//! The monitor holds the session's coordination lock across both the
//! activity check and the bounded sleep. A shutdown request that lands
//! between "decide not to unmount" and "begin sleeping" therefore cannot
//! be lost: the stop side flips the flag under the same lock and the
//! notify either interrupts the sleep or is observed by the flag re-check
//! on the next loop entry.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::MutexGuard;

use veilfs_mount::{request_unmount, IdleGauge, UnmountError};

use crate::session::SessionContext;

/// Fixed activity-polling interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Seam for requesting an unmount from the host environment.
pub trait UnmountRequester: Send + Sync {
    /// Asks the host to unmount `mountpoint`.
    fn request_unmount(&self, mountpoint: &Path) -> Result<(), UnmountError>;
}

/// The real host unmounter.
#[derive(Debug, Default)]
pub struct HostUnmounter;

impl UnmountRequester for HostUnmounter {
    fn request_unmount(&self, mountpoint: &Path) -> Result<(), UnmountError> {
        request_unmount(mountpoint)
    }
}

/// Number of consecutive idle poll cycles before an unmount is triggered.
pub fn idle_threshold_cycles(idle_minutes: u32, poll_interval: Duration) -> u64 {
    u64::from(idle_minutes) * 60 / poll_interval.as_secs().max(1)
}

/// Handle to a running idle monitor. Stopping is cooperative: clear the
/// liveness flag, wake the thread, join it.
#[derive(Debug)]
pub struct IdleMonitor {
    ctx: Arc<SessionContext>,
    handle: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    /// Starts the monitor with the standard poll interval.
    pub fn spawn(
        ctx: Arc<SessionContext>,
        unmounter: Arc<dyn UnmountRequester>,
    ) -> io::Result<Self> {
        Self::spawn_with_interval(ctx, unmounter, POLL_INTERVAL)
    }

    /// Starts the monitor with an explicit poll interval.
    pub fn spawn_with_interval(
        ctx: Arc<SessionContext>,
        unmounter: Arc<dyn UnmountRequester>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        ctx.monitor_gate.mark_running();

        let thread_ctx = Arc::clone(&ctx);
        let spawned = std::thread::Builder::new()
            .name("veilfs-idle-monitor".to_string())
            .spawn(move || monitor_loop(&thread_ctx, unmounter.as_ref(), poll_interval));

        match spawned {
            Ok(handle) => Ok(Self {
                ctx,
                handle: Some(handle),
            }),
            Err(e) => {
                // Leave the gate consistent for a session without idle
                // supervision.
                ctx.monitor_gate.request_stop();
                Err(e)
            }
        }
    }

    /// Clears the liveness flag, wakes the monitor, and joins it.
    ///
    /// Idempotent: a second call finds the flag already clear and no
    /// thread left to join.
    pub fn stop(&mut self) {
        self.ctx.monitor_gate.request_stop();
        if let Some(handle) = self.handle.take() {
            tracing::debug!("joining idle monitoring thread");
            if handle.join().is_err() {
                tracing::error!("idle monitoring thread panicked");
            }
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(ctx: &SessionContext, unmounter: &dyn UnmountRequester, poll: Duration) {
    let threshold = idle_threshold_cycles(ctx.config().idle_timeout_minutes, poll);
    let mountpoint = ctx.config().opts.unmount_target.clone();
    let mut gauge = IdleGauge::new();
    let mut unmounted_here = false;

    // The unmount notice below announces teardown, so announce the mount.
    tracing::info!("filesystem mounted: {mountpoint}");

    let gate = &ctx.monitor_gate;
    let mut running = gate.lock();
    while *running {
        let sample = gauge.poll(&ctx.activity);
        if sample.idle_cycles >= threshold && sample.open_handles == 0 {
            tracing::info!(
                idle_cycles = sample.idle_cycles,
                "unmounting filesystem due to inactivity: {mountpoint}"
            );
            // The host tools can take a while; let the driver's stop
            // request proceed in the meantime.
            let result = MutexGuard::unlocked(&mut running, || {
                unmounter.request_unmount(Path::new(&mountpoint))
            });
            match result {
                Ok(()) => unmounted_here = true,
                Err(e) => tracing::warn!("idle unmount of {mountpoint} failed: {e}"),
            }
            break;
        }
        gate.wait_for(&mut running, poll);
    }
    drop(running);

    // If the loop ended without this thread unmounting, an external actor
    // (kill signal, manual unmount) tore the mount down.
    if !unmounted_here {
        tracing::info!("filesystem unmounted: {mountpoint}");
    }
    tracing::debug!("idle monitoring thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardedOptions, MountOpts, SessionConfig};
    use crate::root::initialize_root_with_password;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Unmounter that records calls instead of touching the host.
    #[derive(Default)]
    struct RecordingUnmounter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl UnmountRequester for RecordingUnmounter {
        fn request_unmount(&self, _mountpoint: &Path) -> Result<(), UnmountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(UnmountError::Failed {
                    path: "/mnt/test".to_string(),
                    detail: "not mounted".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn context_with_idle_minutes(minutes: u32) -> Arc<SessionContext> {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = MountOpts {
            insecure: true,
            root_dir: format!("{}/", dir.path().display()),
            mount_point: "/mnt/test/".to_string(),
            unmount_target: "/mnt/test".to_string(),
            idle_tracking: minutes > 0,
            ..MountOpts::default()
        };
        let root = initialize_root_with_password(&opts, "pw").expect("root");
        std::mem::forget(dir);
        let config = Arc::new(SessionConfig {
            is_daemon: false,
            is_threaded: true,
            is_verbose: false,
            fuse_debug: false,
            idle_timeout_minutes: minutes,
            syslog_tag: "veilfs".to_string(),
            forwarded: ForwardedOptions::new("veilfs"),
            opts,
        });
        Arc::new(SessionContext::new(config, root))
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn one_minute_timeout_is_six_standard_cycles() {
        assert_eq!(idle_threshold_cycles(1, Duration::from_secs(10)), 6);
        assert_eq!(idle_threshold_cycles(0, Duration::from_secs(10)), 0);
        assert_eq!(idle_threshold_cycles(30, Duration::from_secs(10)), 180);
    }

    #[test]
    fn idle_session_triggers_exactly_one_unmount_request() {
        let ctx = context_with_idle_minutes(1);
        let unmounter = Arc::new(RecordingUnmounter::default());

        // Sub-second polls clamp to a one-second divisor, so a one-minute
        // timeout needs 60 one-millisecond cycles here.
        let mut monitor = IdleMonitor::spawn_with_interval(
            Arc::clone(&ctx),
            Arc::clone(&unmounter) as Arc<dyn UnmountRequester>,
            Duration::from_millis(1),
        )
        .expect("spawn");

        assert!(wait_until(Duration::from_secs(5), || {
            unmounter.calls.load(Ordering::SeqCst) > 0
        }));
        monitor.stop();
        assert_eq!(unmounter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_handles_prevent_the_idle_unmount() {
        let ctx = context_with_idle_minutes(1);
        let unmounter = Arc::new(RecordingUnmounter::default());

        ctx.activity.file_opened();
        let mut monitor = IdleMonitor::spawn_with_interval(
            Arc::clone(&ctx),
            Arc::clone(&unmounter) as Arc<dyn UnmountRequester>,
            Duration::from_millis(1),
        )
        .expect("spawn");

        assert!(!wait_until(Duration::from_millis(300), || {
            unmounter.calls.load(Ordering::SeqCst) > 0
        }));

        ctx.activity.file_released();
        assert!(wait_until(Duration::from_secs(5), || {
            unmounter.calls.load(Ordering::SeqCst) > 0
        }));
        monitor.stop();
    }

    #[test]
    fn failed_unmount_still_stops_the_monitor() {
        let ctx = context_with_idle_minutes(1);
        let unmounter = Arc::new(RecordingUnmounter {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        let mut monitor = IdleMonitor::spawn_with_interval(
            Arc::clone(&ctx),
            Arc::clone(&unmounter) as Arc<dyn UnmountRequester>,
            Duration::from_millis(1),
        )
        .expect("spawn");

        assert!(wait_until(Duration::from_secs(5), || {
            unmounter.calls.load(Ordering::SeqCst) > 0
        }));

        // The loop must have exited on its own; stop() only joins.
        let start = Instant::now();
        monitor.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(unmounter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_signal_during_a_long_poll_is_seen_within_the_interval() {
        let ctx = context_with_idle_minutes(60);
        let unmounter = Arc::new(RecordingUnmounter::default());

        // A one-hour poll interval: if the signal were lost the join
        // would block far past the assertion window.
        let mut monitor = IdleMonitor::spawn_with_interval(
            Arc::clone(&ctx),
            Arc::clone(&unmounter) as Arc<dyn UnmountRequester>,
            Duration::from_secs(3600),
        )
        .expect("spawn");

        let start = Instant::now();
        monitor.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(unmounter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn immediate_stop_before_the_thread_runs_is_not_lost() {
        // Race the stop against thread startup repeatedly; every round
        // must join promptly.
        for _ in 0..20 {
            let ctx = context_with_idle_minutes(60);
            let unmounter = Arc::new(RecordingUnmounter::default());
            let mut monitor = IdleMonitor::spawn_with_interval(
                Arc::clone(&ctx),
                Arc::clone(&unmounter) as Arc<dyn UnmountRequester>,
                Duration::from_secs(3600),
            )
            .expect("spawn");
            monitor.stop();
        }
    }

    #[test]
    fn stopping_twice_does_not_deadlock_or_double_join() {
        let ctx = context_with_idle_minutes(5);
        let unmounter = Arc::new(RecordingUnmounter::default());
        let mut monitor = IdleMonitor::spawn_with_interval(
            Arc::clone(&ctx),
            Arc::clone(&unmounter) as Arc<dyn UnmountRequester>,
            Duration::from_millis(50),
        )
        .expect("spawn");

        monitor.stop();
        monitor.stop();
        assert!(!ctx.monitor_gate.is_running());
    }
}
