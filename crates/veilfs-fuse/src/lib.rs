//! FUSE control plane for the veilfs encrypted filesystem overlay.
//!
//! This crate owns the mount-session lifecycle: parsing mount
//! configuration into an immutable [`SessionConfig`], initializing the
//! encrypted root, registering the operation table with the kernel-facing
//! dispatch layer, supervising the session with the idle-timeout monitor,
//! and tearing everything down on exit.
//!
//! # Usage
//!
//! ```ignore
//! use veilfs_fuse::{args, driver};
//!
//! let cli = args::Cli::parse();
//! let config = args::build_config(&cli, "veilfs", &validation_ctx)?;
//! driver::run_session(config)?;
//! ```

pub mod args;
pub mod config;
pub mod driver;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod monitor;
pub mod root;
pub mod session;

pub use args::{build_config, Cli, DirRole, DirSetup, InteractiveDirSetup, ValidationCtx};
pub use config::{ForwardedOptions, MountOpts, SessionConfig, MAX_FORWARDED};
pub use error::{ConfigError, DriverError, RootInitError};
pub use filesystem::VeilFs;
pub use monitor::{IdleMonitor, UnmountRequester, POLL_INTERVAL};
pub use root::{initialize_root, EncryptedRoot};
pub use session::SessionContext;
