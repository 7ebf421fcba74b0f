//! The shared session context handed to every operation callback.
//!
//! One [`SessionContext`] exists per mount session. The dispatch layer's
//! callbacks read it for the lifetime of the mount, and the idle-timeout
//! monitor polls its activity tracker. The root slot has single-writer
//! discipline: the driver sets it at construction (before the operation
//! table is registered, so no callback ever observes an absent root) and
//! clears it exactly once at teardown, after the dispatch loop has
//! returned and no callback can run.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use veilfs_mount::FsActivity;

use crate::config::SessionConfig;
use crate::root::EncryptedRoot;

/// Coordination point between the mount driver and the idle monitor.
///
/// The mutex guards only the monitor's liveness flag; pairing the activity
/// check and the timed wait under that one lock is what makes a stop
/// signal sent just before the wait impossible to lose: `request_stop`
/// flips the flag under the lock, and the monitor re-reads the flag under
/// the same lock before every wait.
#[derive(Debug, Default)]
pub struct MonitorGate {
    running: Mutex<bool>,
    wakeup: Condvar,
}

impl MonitorGate {
    /// Marks the monitor as running. Called by the driver before the
    /// monitor thread starts.
    pub fn mark_running(&self) {
        *self.running.lock() = true;
    }

    /// Clears the liveness flag and wakes the monitor if it is sleeping.
    ///
    /// Safe to call any number of times; after the first, the flag is
    /// already clear and the notify finds no waiter.
    pub fn request_stop(&self) {
        let mut running = self.running.lock();
        *running = false;
        self.wakeup.notify_all();
    }

    /// Whether the liveness flag is currently set.
    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Locks the liveness flag for the monitor's check-then-wait loop.
    pub fn lock(&self) -> MutexGuard<'_, bool> {
        self.running.lock()
    }

    /// Sleeps on the wakeup condition for at most `timeout`, releasing the
    /// given guard while asleep. Returns true if the wait timed out rather
    /// than being signaled.
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, bool>, timeout: Duration) -> bool {
        self.wakeup.wait_for(guard, timeout).timed_out()
    }
}

/// Shared state reachable from every operation callback and the monitor.
pub struct SessionContext {
    config: Arc<SessionConfig>,
    root: RwLock<Option<Arc<EncryptedRoot>>>,
    /// Monitor liveness flag plus wakeup condition.
    pub monitor_gate: MonitorGate,
    /// Activity counters polled by the idle monitor.
    pub activity: Arc<FsActivity>,
    /// Owner-substitution behavior for multi-user mounts.
    pub public_filesystem: bool,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("public_filesystem", &self.public_filesystem)
            .field("monitor_running", &self.monitor_gate.is_running())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Builds the context with its root already in place.
    pub fn new(config: Arc<SessionConfig>, root: Arc<EncryptedRoot>) -> Self {
        let public_filesystem = config.opts.owner_create;
        Self {
            config,
            root: RwLock::new(Some(root)),
            monitor_gate: MonitorGate::default(),
            activity: Arc::new(FsActivity::new()),
            public_filesystem,
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The mounted root, if teardown has not yet cleared it.
    pub fn root(&self) -> Option<Arc<EncryptedRoot>> {
        self.root.read().clone()
    }

    /// Clears the root slot. Driver teardown only: the dispatch loop has
    /// already returned, so no callback can observe the cleared slot.
    pub fn clear_root(&self) -> Option<Arc<EncryptedRoot>> {
        self.root.write().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardedOptions, MountOpts};
    use crate::root::initialize_root_with_password;

    fn test_context() -> SessionContext {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = MountOpts {
            insecure: true,
            root_dir: format!("{}/", dir.path().display()),
            ..MountOpts::default()
        };
        let root = initialize_root_with_password(&opts, "pw").expect("root");
        let config = Arc::new(SessionConfig {
            is_daemon: false,
            is_threaded: true,
            is_verbose: false,
            fuse_debug: false,
            idle_timeout_minutes: 0,
            syslog_tag: "veilfs".to_string(),
            forwarded: ForwardedOptions::new("veilfs"),
            opts,
        });
        // Leak the tempdir handle: the backing files only need to outlive
        // the test body, and dropping it early would delete the root.
        std::mem::forget(dir);
        SessionContext::new(config, root)
    }

    #[test]
    fn root_is_present_until_cleared_exactly_once() {
        let ctx = test_context();
        assert!(ctx.root().is_some());

        let released = ctx.clear_root();
        assert!(released.is_some());
        assert!(ctx.root().is_none());
        assert!(ctx.clear_root().is_none());
    }

    #[test]
    fn gate_flag_transitions() {
        let gate = MonitorGate::default();
        assert!(!gate.is_running());
        gate.mark_running();
        assert!(gate.is_running());
        gate.request_stop();
        assert!(!gate.is_running());
        // Stopping again is harmless.
        gate.request_stop();
        assert!(!gate.is_running());
    }

    #[test]
    fn stop_signal_before_wait_is_not_lost() {
        let gate = MonitorGate::default();
        gate.mark_running();
        gate.request_stop();

        // A monitor loop entered after the signal observes the cleared
        // flag immediately instead of sleeping a full interval.
        let guard = gate.lock();
        assert!(!*guard);
    }

    #[test]
    fn wait_for_times_out_when_not_signaled() {
        let gate = MonitorGate::default();
        gate.mark_running();
        let mut guard = gate.lock();
        let timed_out = gate.wait_for(&mut guard, Duration::from_millis(10));
        assert!(timed_out);
        assert!(*guard);
    }

    #[test]
    fn public_filesystem_follows_owner_create() {
        let ctx = test_context();
        assert!(!ctx.public_filesystem);
    }
}
