//! Error taxonomy for the mount control plane.
//!
//! Configuration and path errors are fully resolved before any resource
//! (thread, root, registered operation table) exists, so they never need
//! rollback. Errors after that point flow through [`DriverError`], and the
//! driver runs full teardown regardless of which variant it is returning.

use std::path::PathBuf;

use thiserror::Error;
use veilfs_mount::UnmountError;

/// Rejections produced while turning parsed arguments into a session
/// configuration. All of these are terminal for the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Wrong number of positional arguments for the requested form.
    #[error("{0}")]
    MissingArguments(String),

    /// Absolute-path or self-containment violation.
    #[error("{0}")]
    InvalidPathConfiguration(String),

    /// Mutually-dependent options misused.
    #[error("{0}")]
    InvalidModeCombination(String),

    /// Root or mount directory missing and not creatable.
    #[error("{0}")]
    PathUnavailable(String),
}

/// Failures while initializing the encrypted root.
///
/// None of these start a thread or register an operation table: the driver
/// aborts before either exists.
#[derive(Debug, Error)]
pub enum RootInitError {
    /// No volume configuration was found and one could not be created.
    #[error("no volume configuration found at {0}")]
    ConfigNotFound(PathBuf),

    /// The configuration document could not be parsed.
    #[error("corrupt volume configuration {path}: {detail}")]
    ConfigCorrupt {
        /// Location of the offending document.
        path: PathBuf,
        /// Parser diagnostic.
        detail: String,
    },

    /// The configuration is from an unsupported format version.
    #[error("unsupported volume configuration version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version recorded in the document.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// The supplied password does not match the volume key fingerprint.
    #[error("invalid password for volume")]
    BadPassword,

    /// No password could be obtained from the configured source.
    #[error("unable to obtain password: {0}")]
    PasswordUnavailable(String),

    /// The volume uses a null cipher and `--insecure` was not given.
    #[error("volume uses a null cipher; pass --insecure to mount it anyway")]
    InsecureCipherRefused,

    /// `--require-macs` was given but the volume has no integrity headers.
    #[error("volume configuration lacks integrity headers required by --require-macs")]
    MacsRequired,

    /// Filesystem error while reading or writing the configuration.
    #[error("volume configuration i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by the mount driver after configuration is validated.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The encrypted root could not be initialized.
    #[error(transparent)]
    RootInit(#[from] RootInitError),

    /// Detaching from the terminal failed.
    #[error("failed to daemonize: {0}")]
    Daemonize(std::io::Error),

    /// The blocking dispatch loop returned an error.
    #[error("filesystem dispatch loop failed: {0}")]
    DispatchLoop(std::io::Error),

    /// The dispatch loop terminated by panic; cleanup still ran.
    #[error("filesystem dispatch loop terminated abnormally")]
    DispatchAbort,

    /// The `--unmount` request failed.
    #[error(transparent)]
    Unmount(#[from] UnmountError),
}
