//! In-process daemonization and the preserved diagnostic stream.
//!
//! Detaching redirects stderr to `/dev/null`, so a mount that fails shortly
//! after daemonizing would normally have nowhere to report the problem. The
//! driver duplicates the stderr handle into a [`PreservedStderr`] before
//! detaching; the duplicate survives the redirection and can carry one last
//! diagnostic back to the invoking terminal.
//!
//! Daemonization here is the single-fork `setsid()` approach: the parent
//! exits, the child becomes a session leader with no controlling terminal
//! and its standard streams pointed at `/dev/null`. It must run before any
//! thread is spawned.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

/// A duplicate of the process stderr taken before daemonization.
///
/// Writes go to the original terminal even after the real stderr has been
/// redirected. The handle closes at most once, either explicitly (when the
/// dispatch loop is known to be up) or on drop.
#[derive(Debug)]
pub struct PreservedStderr {
    fd: AtomicI32,
}

impl PreservedStderr {
    /// Duplicates the current stderr handle.
    #[cfg(unix)]
    pub fn capture() -> io::Result<Self> {
        // SAFETY: dup on a standard descriptor; ownership of the duplicate
        // stays with this struct.
        let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: AtomicI32::new(fd),
        })
    }

    /// Writes a best-effort diagnostic to the preserved stream.
    ///
    /// Errors are swallowed: by the time this is used the session is already
    /// failing and there is no better channel to report through.
    pub fn write_diagnostic(&self, msg: &str) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let bytes = msg.as_bytes();
        // SAFETY: fd is a descriptor this struct duplicated and has not yet
        // closed; the buffer is valid for the given length.
        unsafe {
            let _ = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        }
    }

    /// Closes the preserved handle. Subsequent writes become no-ops.
    ///
    /// Idempotent: only the first call closes the descriptor.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was owned by this struct and is closed exactly once.
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.fd.load(Ordering::Acquire) >= 0
    }
}

impl Drop for PreservedStderr {
    fn drop(&mut self) {
        self.close();
    }
}

/// Detaches the current process from its controlling terminal.
///
/// Forks (the parent exits 0), becomes a session leader via `setsid()`,
/// changes the working directory to `/`, and redirects stdin/stdout/stderr
/// to `/dev/null`.
///
/// Must be called while the process is still single-threaded: forked
/// children only carry the calling thread.
#[cfg(unix)]
pub fn daemonize() -> io::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: the process is single-threaded at this point; the child only
    // runs async-signal-safe work before returning into normal control flow.
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(io::Error::from)?;
    std::env::set_current_dir("/")?;

    // SAFETY: standard descriptor plumbing on fds this process owns.
    unsafe {
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null < 0 {
            return Err(io::Error::last_os_error());
        }
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(null, target) < 0 {
                let err = io::Error::last_os_error();
                libc::close(null);
                return Err(err);
            }
        }
        if null > libc::STDERR_FILENO {
            libc::close(null);
        }
    }

    Ok(())
}

/// Check if the current process is running detached from a terminal.
#[cfg(unix)]
pub fn is_daemon() -> bool {
    // A true daemon has no controlling terminal to open.
    std::fs::File::open("/dev/tty").is_err()
}

#[cfg(not(unix))]
pub fn is_daemon() -> bool {
    false
}
