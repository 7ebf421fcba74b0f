//! The mount driver: one session from validated configuration to clean
//! process exit.
//!
//! Ordering is load-bearing here. The root is initialized before any
//! thread exists (the password prompt still owns the terminal, and a
//! failure aborts with nothing to unwind). Daemonizing happens after root
//! initialization and before the monitor thread starts, because a fork
//! does not carry threads. The context's root is in place before the
//! operation table is registered, and the table is registered before the
//! dispatch loop starts, so no callback ever observes an absent root. On
//! the way out, teardown runs regardless of how the dispatch loop exited,
//! panics included.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fuser::MountOption;

use veilfs_mount::{daemonize, request_unmount, PreservedStderr, SecretPool};

use crate::config::{forwarded_to_mount_options, SessionConfig};
use crate::error::DriverError;
use crate::filesystem::VeilFs;
use crate::monitor::{HostUnmounter, IdleMonitor};
use crate::root::initialize_root;
use crate::session::SessionContext;

/// Dispatch-loop exits inside this window after a daemonized start are
/// treated as immediate failures worth reporting on the preserved stream.
const EARLY_FAILURE_WINDOW: Duration = Duration::from_secs(1);

/// Whether a dispatch-loop exit counts as an immediate failure.
fn is_early_exit(elapsed: Duration) -> bool {
    elapsed <= EARLY_FAILURE_WINDOW
}

/// Mount options handed to the dispatch layer: identity, read-only state,
/// then the forwarded tokens translated verbatim.
fn build_mount_options(config: &SessionConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("veilfs".to_string()),
        MountOption::Subtype("veilfs".to_string()),
    ];
    if config.opts.read_only {
        options.push(MountOption::RO);
    }
    options.extend(forwarded_to_mount_options(&config.forwarded));
    options
}

/// The `--unmount` path: no daemonizing, no operation table, no context.
/// Just ask the host environment and report the outcome.
pub fn run_unmount(config: &SessionConfig) -> Result<(), DriverError> {
    let target = &config.opts.unmount_target;
    println!("Filesystem unmounting: {target}");
    request_unmount(Path::new(target))?;
    Ok(())
}

/// Runs one mount session to completion.
pub fn run_session(config: SessionConfig) -> Result<(), DriverError> {
    let config = Arc::new(config);

    // Process-wide sensitive-memory state, scoped to the threading mode.
    let pool = SecretPool::install(config.is_threaded);

    // Initialize the encrypted root. May prompt for a password, so this
    // stays ahead of daemonization; a failure aborts before any thread or
    // operation table exists.
    let root = initialize_root(&config.opts)?;

    if !config.is_threaded && config.idle_monitor_enabled() {
        eprintln!(
            "Note: requested single-threaded mode, but an idle\n\
             timeout was specified.  The filesystem will operate\n\
             single-threaded, but threads will still be used to\n\
             implement idle checking."
        );
    }

    let ctx = Arc::new(SessionContext::new(Arc::clone(&config), root));
    tracing::debug!("root directory: {}", config.opts.root_dir);
    tracing::debug!("session options: {}", config.describe());

    // Keep a duplicate of stderr around in case the dispatch loop fails
    // right after the real stream has been redirected away.
    let preserved = if config.is_daemon {
        let preserved = Arc::new(PreservedStderr::capture().map_err(DriverError::Daemonize)?);
        daemonize().map_err(DriverError::Daemonize)?;
        Some(preserved)
    } else {
        None
    };

    // Permission bits belong to the overlay's own logic; an inherited
    // file-creation mask must not filter pass-through operations.
    reset_umask();

    let filesystem = VeilFs::new(Arc::clone(&ctx), preserved.clone());
    let mount_options = build_mount_options(&config);

    // The monitor starts only after the context exists and before the
    // dispatch loop. Failure to start it is logged and the mount proceeds
    // without idle supervision.
    let mut monitor = None;
    if config.idle_monitor_enabled() {
        tracing::debug!("starting idle monitoring thread");
        match IdleMonitor::spawn(Arc::clone(&ctx), Arc::new(HostUnmounter)) {
            Ok(started) => monitor = Some(started),
            Err(e) => tracing::error!("error starting idle monitor thread: {e}"),
        }
    }

    if config.opts.annotate {
        eprintln!("$STATUS$ fuse_main_start");
    }

    let mountpoint = config.opts.mount_point_path().to_path_buf();
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        fuser::mount2(filesystem, &mountpoint, &mount_options)
    }));
    let elapsed = started.elapsed();

    if config.opts.annotate {
        eprintln!("$STATUS$ fuse_main_end");
    }

    let result = match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DriverError::DispatchLoop(e)),
        Err(_) => {
            tracing::error!("internal error: caught panic from the dispatch loop");
            Err(DriverError::DispatchAbort)
        }
    };

    // A daemonized loop that exits almost immediately never got a chance
    // to report anything: say a few words on the preserved terminal.
    if result.is_err() && config.is_daemon && is_early_exit(elapsed) {
        if let Some(preserved) = &preserved {
            preserved.write_diagnostic(
                "fuse failed.  Common problems:\n \
                 - fuse kernel module not installed (modprobe fuse)\n \
                 - invalid options -- see usage message\n",
            );
        }
    }

    if let Some(mut monitor) = monitor.take() {
        tracing::debug!("waking up monitoring thread");
        monitor.stop();
    }

    ctx.clear_root();
    pool.purge();

    result
}

#[cfg(unix)]
fn reset_umask() {
    use nix::sys::stat::{umask, Mode};
    umask(Mode::empty());
}

#[cfg(not(unix))]
fn reset_umask() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardedOptions, MountOpts};

    fn config_with(opts: MountOpts, forwarded: ForwardedOptions) -> SessionConfig {
        SessionConfig {
            is_daemon: false,
            is_threaded: true,
            is_verbose: false,
            fuse_debug: false,
            idle_timeout_minutes: 0,
            syslog_tag: "veilfs".to_string(),
            forwarded,
            opts,
        }
    }

    #[test]
    fn early_exit_window_is_about_a_second() {
        assert!(is_early_exit(Duration::from_millis(200)));
        assert!(is_early_exit(Duration::from_secs(1)));
        assert!(!is_early_exit(Duration::from_secs(2)));
    }

    #[test]
    fn mount_options_carry_identity_and_forwarded_tokens() {
        let mut forwarded = ForwardedOptions::new("veilfs");
        forwarded.push_opt("allow_other");
        forwarded.set_mount_point("/mnt/x/");

        let config = config_with(MountOpts::default(), forwarded);
        let options = build_mount_options(&config);

        assert!(matches!(&options[0], MountOption::FSName(name) if name == "veilfs"));
        assert!(options
            .iter()
            .any(|o| matches!(o, MountOption::AllowOther)));
        assert!(!options.iter().any(|o| matches!(o, MountOption::RO)));
    }

    #[test]
    fn read_only_sessions_mount_read_only() {
        let opts = MountOpts {
            read_only: true,
            ..MountOpts::default()
        };
        let config = config_with(opts, ForwardedOptions::new("veilfs"));
        let options = build_mount_options(&config);
        assert!(options.iter().any(|o| matches!(o, MountOption::RO)));
    }

    #[test]
    fn unmount_of_an_unmounted_directory_reports_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = MountOpts {
            unmount: true,
            unmount_target: dir.path().display().to_string(),
            ..MountOpts::default()
        };
        let config = config_with(opts, ForwardedOptions::new("veilfs"));
        let err = run_unmount(&config).unwrap_err();
        assert!(matches!(err, DriverError::Unmount(_)));
    }
}
