//! Asking the host environment to unmount a path.
//!
//! Used by the `--unmount` command path and by the idle-timeout monitor when
//! a session has been idle past its threshold.
//!
//! # Platform support
//!
//! - **Linux**: `fusermount -u`, falling back to `umount`
//! - **macOS**: `diskutil unmount`, falling back to `umount`
//! - **Other**: returns [`UnmountError::Unsupported`]

use std::path::Path;
use std::process::Command;

use thiserror::Error;

/// Failure to unmount a target path.
#[derive(Debug, Error)]
pub enum UnmountError {
    /// The unmount helper could not be spawned at all.
    #[error("failed to run {tool}: {source}")]
    Spawn {
        /// Name of the helper binary.
        tool: &'static str,
        /// Underlying spawn error.
        source: std::io::Error,
    },

    /// Every unmount helper ran but reported failure.
    #[error("failed to unmount {path}: {detail}")]
    Failed {
        /// The target that could not be unmounted.
        path: String,
        /// Trimmed stderr of the last helper tried.
        detail: String,
    },

    /// No unmount mechanism exists for this platform.
    #[error("unmount is not supported on this platform")]
    Unsupported,
}

/// Requests that the host environment unmount `mountpoint`.
///
/// The request is not retried: callers decide whether a failure is fatal.
pub fn request_unmount(mountpoint: &Path) -> Result<(), UnmountError> {
    #[cfg(target_os = "linux")]
    {
        request_unmount_linux(mountpoint)
    }

    #[cfg(target_os = "macos")]
    {
        request_unmount_macos(mountpoint)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = mountpoint;
        Err(UnmountError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
fn request_unmount_linux(mountpoint: &Path) -> Result<(), UnmountError> {
    // fusermount is the FUSE-aware path and works unprivileged.
    match Command::new("fusermount").arg("-u").arg(mountpoint).output() {
        Ok(output) if output.status.success() => {
            tracing::debug!(mountpoint = %mountpoint.display(), "unmounted via fusermount");
            return Ok(());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                mountpoint = %mountpoint.display(),
                "fusermount -u failed: {}",
                stderr.trim()
            );
        }
        Err(e) => {
            tracing::debug!("fusermount not available: {}", e);
        }
    }

    let output = Command::new("umount")
        .arg(mountpoint)
        .output()
        .map_err(|source| UnmountError::Spawn {
            tool: "umount",
            source,
        })?;

    if output.status.success() {
        tracing::debug!(mountpoint = %mountpoint.display(), "unmounted via umount");
        return Ok(());
    }

    Err(UnmountError::Failed {
        path: mountpoint.display().to_string(),
        detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(target_os = "macos")]
fn request_unmount_macos(mountpoint: &Path) -> Result<(), UnmountError> {
    match Command::new("diskutil")
        .arg("unmount")
        .arg(mountpoint)
        .output()
    {
        Ok(output) if output.status.success() => {
            tracing::debug!(mountpoint = %mountpoint.display(), "unmounted via diskutil");
            return Ok(());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                mountpoint = %mountpoint.display(),
                "diskutil unmount failed: {}",
                stderr.trim()
            );
        }
        Err(e) => {
            tracing::debug!("diskutil not available: {}", e);
        }
    }

    let output = Command::new("umount")
        .arg(mountpoint)
        .output()
        .map_err(|source| UnmountError::Spawn {
            tool: "umount",
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }

    Err(UnmountError::Failed {
        path: mountpoint.display().to_string(),
        detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmounting_a_plain_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = request_unmount(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn unmount_error_mentions_the_path() {
        let err = UnmountError::Failed {
            path: "/mnt/secret".to_string(),
            detail: "not mounted".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/mnt/secret"));
        assert!(msg.contains("not mounted"));
    }
}
