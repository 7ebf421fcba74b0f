//! The immutable session configuration produced by argument parsing.
//!
//! [`SessionConfig`] is built exactly once per process invocation and never
//! mutated afterwards: the driver owns it and shares it read-only with the
//! session context and every operation callback.

use std::path::{Path, PathBuf};

/// Capacity of the forwarded-option sequence.
///
/// Exceeding it is a programming-contract violation (the parser can only
/// generate a bounded number of tokens), not a user error, so pushes past
/// the bound panic.
pub const MAX_FORWARDED: usize = 32;

/// Tokens forwarded verbatim to the mount interface.
///
/// Slot 0 carries the program name and slot 1 is reserved for the mount
/// point, which is filled last, after validation succeeds.
#[derive(Debug, Clone)]
pub struct ForwardedOptions {
    tokens: Vec<String>,
}

impl ForwardedOptions {
    /// Creates the sequence with the program name in slot 0 and an empty
    /// reserved slot for the mount point.
    pub fn new(program: &str) -> Self {
        Self {
            tokens: vec![program.to_string(), String::new()],
        }
    }

    /// Appends one token.
    pub fn push(&mut self, token: impl Into<String>) {
        assert!(
            self.tokens.len() < MAX_FORWARDED,
            "forwarded-option capacity ({MAX_FORWARDED}) exceeded"
        );
        self.tokens.push(token.into());
    }

    /// Appends a `-o value` pair.
    pub fn push_opt(&mut self, value: &str) {
        self.push("-o");
        self.push(value);
    }

    /// Fills the reserved mount-point slot.
    pub fn set_mount_point(&mut self, mount_point: &str) {
        self.tokens[1] = mount_point.to_string();
    }

    /// The full token sequence, reserved slots included.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of tokens, reserved slots included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false: the reserved slots exist from construction.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Counts how many times the given `-o value` pair appears.
    pub fn count_opt(&self, value: &str) -> usize {
        self.tokens[2..]
            .windows(2)
            .filter(|w| w[0] == "-o" && w[1] == value)
            .count()
    }
}

/// Volume configuration profile selected at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    /// Interactive defaults.
    #[default]
    Default,
    /// Preconfigured standard profile.
    Standard,
    /// Preconfigured paranoia profile (integrity headers on).
    Paranoia,
}

/// Recognized mount options, immutable once parsing completes.
#[derive(Debug, Clone)]
pub struct MountOpts {
    /// Verify the supplied key against the volume fingerprint.
    pub check_key: bool,
    /// Decode data even when an integrity error is detected.
    pub force_decode: bool,
    /// Act as a multi-user filesystem (requires elevated privilege).
    pub owner_create: bool,
    /// Read the password from standard input.
    pub use_stdin: bool,
    /// Read the password from the environment.
    pub use_env_password: bool,
    /// Emit machine-readable status annotations on stderr.
    pub annotate: bool,
    /// Present a reverse-encryption view of the root.
    pub reverse_encryption: bool,
    /// Reject volumes lacking integrity headers.
    pub require_mac: bool,
    /// Permit null-cipher volumes.
    pub insecure: bool,
    /// Unmount-only invocation.
    pub unmount: bool,
    /// Refuse mutating operations.
    pub read_only: bool,
    /// Lazy mount semantics.
    pub mount_on_demand: bool,
    /// Delay the initial mount until first use.
    pub delay_mount: bool,
    /// Idle tracking requested (implied by an idle timeout).
    pub idle_tracking: bool,
    /// Disable the overlay's own caching.
    pub no_cache: bool,
    /// External password-prompt program.
    pub password_program: Option<String>,
    /// Explicit volume-configuration path (overrides the environment).
    pub config_path: Option<PathBuf>,
    /// Backing directory, slash-terminated.
    pub root_dir: String,
    /// Mount point, slash-terminated.
    pub mount_point: String,
    /// Unmount target exactly as the user gave it.
    pub unmount_target: String,
    /// Volume-creation profile.
    pub config_mode: ConfigMode,
}

impl Default for MountOpts {
    fn default() -> Self {
        Self {
            check_key: true,
            force_decode: false,
            owner_create: false,
            use_stdin: false,
            use_env_password: false,
            annotate: false,
            reverse_encryption: false,
            require_mac: false,
            insecure: false,
            unmount: false,
            read_only: false,
            mount_on_demand: false,
            delay_mount: false,
            idle_tracking: false,
            no_cache: false,
            password_program: None,
            config_path: None,
            root_dir: String::new(),
            mount_point: String::new(),
            unmount_target: String::new(),
            config_mode: ConfigMode::Default,
        }
    }
}

impl MountOpts {
    /// The backing directory as a path.
    pub fn root_dir_path(&self) -> &Path {
        Path::new(&self.root_dir)
    }

    /// The mount point as a path.
    pub fn mount_point_path(&self) -> &Path {
        Path::new(&self.mount_point)
    }
}

/// Everything a mount session needs to know, fixed at parse time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Detach and log to the session log file instead of the console.
    pub is_daemon: bool,
    /// Allow the dispatch loop to service requests concurrently.
    pub is_threaded: bool,
    /// Verbose diagnostics.
    pub is_verbose: bool,
    /// Interface-layer debug tracing requested.
    pub fuse_debug: bool,
    /// Idle minutes before self-unmount; 0 disables monitoring.
    pub idle_timeout_minutes: u32,
    /// Identifier for daemon-mode logging.
    pub syslog_tag: String,
    /// Tokens forwarded verbatim to the mount interface.
    pub forwarded: ForwardedOptions,
    /// Recognized mount options.
    pub opts: MountOpts,
}

impl SessionConfig {
    /// Whether the idle-timeout monitor should run for this session.
    pub fn idle_monitor_enabled(&self) -> bool {
        self.idle_timeout_minutes > 0
    }

    /// Whether the kernel attribute/entry caches were disabled.
    ///
    /// The dispatch layer implements these timeouts per reply, so the
    /// forwarded cache-disable tokens are read back from the forwarded
    /// list rather than handed to the kernel.
    pub fn attr_caching_disabled(&self) -> bool {
        self.forwarded.count_opt("attr_timeout=0") > 0
    }

    /// One-line summary of the options in effect, for log dumps.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        s.push_str(if self.is_daemon { "(daemon) " } else { "(fg) " });
        s.push_str(if self.is_threaded { "(threaded) " } else { "(UP) " });
        if self.idle_timeout_minutes > 0 {
            s.push_str(&format!("(timeout {}) ", self.idle_timeout_minutes));
        }
        if self.opts.check_key {
            s.push_str("(keyCheck) ");
        }
        if self.opts.force_decode {
            s.push_str("(forceDecode) ");
        }
        if self.opts.owner_create {
            s.push_str("(ownerCreate) ");
        }
        if self.opts.use_stdin {
            s.push_str("(useStdin) ");
        }
        if self.opts.annotate {
            s.push_str("(annotate) ");
        }
        if self.opts.reverse_encryption {
            s.push_str("(reverseEncryption) ");
        }
        if self.opts.mount_on_demand {
            s.push_str("(mountOnDemand) ");
        }
        if self.opts.delay_mount {
            s.push_str("(delayMount) ");
        }
        for token in self.forwarded.tokens() {
            s.push_str(token);
            s.push(' ');
        }
        s
    }
}

/// Translates forwarded tokens into typed mount options for the dispatch
/// layer.
///
/// `-o value` pairs map to their typed equivalents where one exists and
/// pass through as custom options otherwise. The program-name and
/// mount-point slots are skipped (the mount point travels separately), as
/// are the `-f`/`-s`/`-d` dispatch hints, which the session configuration
/// already reflects.
pub fn forwarded_to_mount_options(forwarded: &ForwardedOptions) -> Vec<fuser::MountOption> {
    let mut options = Vec::new();
    let tokens = &forwarded.tokens()[2..];
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        if token == "-o" {
            if let Some(value) = tokens.get(i + 1) {
                options.extend(map_interface_option(value));
                i += 2;
                continue;
            }
            tracing::debug!("dangling -o token at end of forwarded options");
            break;
        }
        if let Some(value) = token.strip_prefix("-o") {
            options.extend(map_interface_option(value));
        } else if matches!(token, "-f" | "-s" | "-d") {
            // Dispatch hints; already captured in the session configuration.
        } else {
            tracing::debug!(token, "skipping forwarded token with no interface mapping");
        }
        i += 1;
    }
    options
}

fn map_interface_option(value: &str) -> Option<fuser::MountOption> {
    use fuser::MountOption;
    if value.starts_with("attr_timeout=") || value.starts_with("entry_timeout=") {
        // Implemented by the reply TTLs, not by the kernel mount call.
        tracing::debug!(value, "cache timeout consumed by the dispatch layer");
        return None;
    }
    Some(match value {
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        other => MountOption::CUSTOM(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_slots_come_first() {
        let mut fwd = ForwardedOptions::new("veilfs");
        fwd.push_opt("use_ino");
        fwd.set_mount_point("/mnt/crypt/");

        let tokens = fwd.tokens();
        assert_eq!(tokens[0], "veilfs");
        assert_eq!(tokens[1], "/mnt/crypt/");
        assert_eq!(&tokens[2..], &["-o", "use_ino"]);
    }

    #[test]
    fn count_opt_sees_only_pairs() {
        let mut fwd = ForwardedOptions::new("veilfs");
        fwd.push_opt("allow_other");
        fwd.push("-s");
        assert_eq!(fwd.count_opt("allow_other"), 1);
        assert_eq!(fwd.count_opt("use_ino"), 0);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn pushing_past_capacity_panics() {
        let mut fwd = ForwardedOptions::new("veilfs");
        for i in 0..MAX_FORWARDED {
            fwd.push(format!("t{i}"));
        }
    }

    #[test]
    fn translation_maps_known_options_and_passes_custom_through() {
        let mut fwd = ForwardedOptions::new("veilfs");
        fwd.push("-f");
        fwd.push_opt("allow_other");
        fwd.push_opt("max_read=4096");
        fwd.push("-s");
        fwd.set_mount_point("/mnt/x/");

        let options = forwarded_to_mount_options(&fwd);
        assert_eq!(options.len(), 2);
        assert!(matches!(options[0], fuser::MountOption::AllowOther));
        assert!(matches!(&options[1], fuser::MountOption::CUSTOM(s) if s == "max_read=4096"));
    }

    #[test]
    fn translation_handles_joined_o_tokens() {
        let mut fwd = ForwardedOptions::new("veilfs");
        fwd.push("-odefault_permissions");
        let options = forwarded_to_mount_options(&fwd);
        assert!(matches!(options[0], fuser::MountOption::DefaultPermissions));
    }

    #[test]
    fn cache_timeouts_are_consumed_by_the_dispatch_layer() {
        let mut fwd = ForwardedOptions::new("veilfs");
        fwd.push_opt("attr_timeout=0");
        fwd.push_opt("entry_timeout=0");
        assert!(forwarded_to_mount_options(&fwd).is_empty());
    }

    #[test]
    fn describe_lists_the_important_flags() {
        let config = SessionConfig {
            is_daemon: true,
            is_threaded: true,
            is_verbose: false,
            fuse_debug: false,
            idle_timeout_minutes: 5,
            syslog_tag: "veilfs".to_string(),
            forwarded: ForwardedOptions::new("veilfs"),
            opts: MountOpts::default(),
        };
        let summary = config.describe();
        assert!(summary.contains("(daemon)"));
        assert!(summary.contains("(timeout 5)"));
        assert!(summary.contains("(keyCheck)"));
    }
}
