//! Shared mount-session lifecycle utilities for the veilfs encrypted overlay.
//!
//! This crate holds the pieces of the mount control plane that do not depend
//! on the FUSE dispatch layer:
//!
//! - [`daemon`] - in-process daemonization and the preserved diagnostic
//!   stream that survives it
//! - [`unmount`] - asking the host environment to unmount a path
//! - [`activity`] - filesystem activity tracking and idle-cycle accounting
//!   for the idle-timeout monitor
//! - [`secrets`] - pooled sensitive buffers, zeroed before release

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod daemon;
pub mod secrets;
pub mod unmount;

pub use activity::{FsActivity, IdleGauge, IdleSample};
pub use daemon::{daemonize, is_daemon, PreservedStderr};
pub use secrets::SecretPool;
pub use unmount::{request_unmount, UnmountError};
