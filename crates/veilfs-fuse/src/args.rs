//! Command-line surface and validation into a [`SessionConfig`].
//!
//! Parsing is two-phase. clap handles the token-level surface (the
//! declarative option table; unknown or malformed options abort immediately
//! with a usage diagnostic). [`build_config`] then applies the semantic
//! rules in a fixed order, so that a mode-conflict diagnosis always wins
//! over a path diagnosis, and produces the immutable session configuration.
//!
//! The directory existence checks consult an injected [`DirSetup`] policy
//! and the `--public` privilege check consults an injected euid, keeping
//! both testable without prompts or root.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};

use crate::config::{ConfigMode, ForwardedOptions, MountOpts, SessionConfig};
use crate::error::ConfigError;

/// Mounts an encrypted filesystem overlay.
#[derive(Parser, Debug, Clone)]
#[command(name = "veilfs")]
#[command(about = "Mounts an encrypted filesystem overlay")]
#[command(after_help = "Example, to mount at ~/crypt with raw storage in ~/.crypt:\n    \
                        veilfs ~/.crypt ~/crypt\n\n\
                        Arguments after `--` are forwarded to the mount interface.")]
pub struct Cli {
    /// Disable multi-threaded dispatch
    #[arg(short = 's')]
    pub single_thread: bool,

    /// Run in foreground; errors go to stderr instead of the session log
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Verbose: output debug messages
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Enable interface-layer debug tracing
    #[arg(short = 'd', long = "fuse-debug")]
    pub fuse_debug: bool,

    /// Auto unmount after a period of inactivity
    #[arg(short = 'i', long = "idle", value_name = "MINUTES")]
    pub idle: Option<u32>,

    /// Do not verify that the correct key is being used
    #[arg(long)]
    pub anykey: bool,

    /// Decode data even if an error is detected (for volumes with
    /// integrity headers)
    #[arg(long)]
    pub forcedecode: bool,

    /// Act as a typical multi-user filesystem (veilfs must be run as root)
    #[arg(long)]
    pub public: bool,

    /// Reverse encryption
    #[arg(long)]
    pub reverse: bool,

    /// Reverse encryption with writes enabled
    #[arg(long)]
    pub reversewrite: bool,

    /// Use the standard preconfigured profile when creating a volume
    #[arg(long, conflicts_with = "paranoia")]
    pub standard: bool,

    /// Use the paranoia preconfigured profile when creating a volume
    #[arg(long)]
    pub paranoia: bool,

    /// Volume configuration file (overrides the VEILFS_CONFIG environment
    /// variable)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Unmount the specified mount point and exit
    #[arg(short = 'u', long = "unmount")]
    pub unmount: bool,

    /// Use an external program for the password prompt
    #[arg(long = "extpass", value_name = "PROGRAM")]
    pub extpass: Option<String>,

    /// Disable all caching
    #[arg(long)]
    pub nocache: bool,

    /// Disable the overlay's data cache
    #[arg(long)]
    pub nodatacache: bool,

    /// Disable the kernel attribute caches
    #[arg(long)]
    pub noattrcache: bool,

    /// Mount on demand
    #[arg(long)]
    pub ondemand: bool,

    /// Delay the initial mount until first use
    #[arg(long)]
    pub delaymount: bool,

    /// Reject volume configurations lacking integrity headers
    #[arg(long = "require-macs")]
    pub require_macs: bool,

    /// Permit null-cipher volume configurations
    #[arg(long)]
    pub insecure: bool,

    /// Read the password from standard input
    #[arg(short = 'S', long = "stdinpass")]
    pub stdinpass: bool,

    /// Read the password from the VEILFS_PASSWORD environment variable
    #[arg(short = 'E')]
    pub envpass: bool,

    /// Identifier used for session-log records
    #[arg(
        short = 't',
        long = "syslogtag",
        value_name = "TAG",
        default_value = "veilfs"
    )]
    pub syslog_tag: String,

    /// Print machine-readable status annotations on stderr
    #[arg(long)]
    pub annotate: bool,

    /// Do not append the baseline forwarded mount options
    #[arg(short = 'N', long = "no-default-flags")]
    pub no_default_flags: bool,

    /// Show the mount-interface options understood by veilfs, then exit
    #[arg(short = 'H', long = "fuse-help")]
    pub fuse_help: bool,

    /// Print the version, then exit
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    /// Forward one raw option to the mount interface
    #[arg(short = 'o', value_name = "OPT", action = clap::ArgAction::Append)]
    pub mount_options: Vec<String>,

    /// rootDir and mountPoint (or, with --unmount, the mount point alone)
    #[arg(value_name = "ARGS")]
    pub args: Vec<String>,
}

/// Which directory a [`DirSetup`] decision concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRole {
    /// The backing root directory.
    Root,
    /// The mount point.
    MountPoint,
}

/// Policy for the exists-or-creatable directory checks.
pub trait DirSetup {
    /// Returns true if the directory exists or was created under the
    /// policy; false leaves it missing and fails validation.
    fn ensure_dir(&self, role: DirRole, path: &Path) -> bool;
}

/// Interactive policy: prompts on stderr and creates with mode 0700 when
/// the user agrees.
#[derive(Debug, Default)]
pub struct InteractiveDirSetup {
    /// Emit annotation lines for driving test harnesses.
    pub annotate: bool,
}

impl DirSetup for InteractiveDirSetup {
    fn ensure_dir(&self, role: DirRole, path: &Path) -> bool {
        if path.is_dir() {
            return true;
        }
        if self.annotate {
            match role {
                DirRole::Root => eprintln!("$PROMPT$ create_root_dir"),
                DirRole::MountPoint => eprintln!("$PROMPT$ create_mount_point"),
            }
        }
        eprint!(
            "The directory \"{}\" does not exist. Should it be created? (y,N) ",
            path.display()
        );
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            return false;
        }

        create_private_dir(path)
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> bool {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .is_ok()
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> bool {
    std::fs::create_dir_all(path).is_ok()
}

/// Context injected into validation: privilege state and the directory
/// policy.
pub struct ValidationCtx<'a> {
    /// Whether the effective uid is root (gates `--public`).
    pub euid_is_root: bool,
    /// Directory exists-or-creatable policy.
    pub dirs: &'a dyn DirSetup,
}

fn slash_terminate(src: &str) -> String {
    if src.ends_with('/') {
        src.to_string()
    } else {
        format!("{src}/")
    }
}

/// Applies the semantic rules to a parsed command line and produces the
/// validated, immutable session configuration.
///
/// Validation order (first failure wins): absolute paths when daemonizing,
/// self-containment, delay-mount implies on-demand, on-demand implies a
/// password program, root directory available, mount point available.
pub fn build_config(
    cli: &Cli,
    program: &str,
    ctx: &ValidationCtx<'_>,
) -> Result<SessionConfig, ConfigError> {
    let mut opts = MountOpts::default();
    let mut forwarded = ForwardedOptions::new(program);
    let mut is_daemon = true;
    let mut is_threaded = true;

    if cli.single_thread {
        is_threaded = false;
    }
    if cli.foreground {
        is_daemon = false;
        forwarded.push("-f");
    }
    if cli.unmount {
        // Log to the console, not the session log, if the unmount fails.
        is_daemon = false;
        opts.unmount = true;
    }
    if cli.fuse_debug {
        forwarded.push("-d");
    }

    let idle_timeout_minutes = cli.idle.unwrap_or(0);
    if cli.idle.is_some() {
        opts.idle_tracking = true;
    }

    opts.check_key = !cli.anykey;
    opts.force_decode = cli.forcedecode;
    opts.use_stdin = cli.stdinpass;
    opts.use_env_password = cli.envpass;
    opts.annotate = cli.annotate;
    opts.require_mac = cli.require_macs;
    opts.insecure = cli.insecure;
    opts.mount_on_demand = cli.ondemand;
    opts.delay_mount = cli.delaymount;
    opts.password_program = cli.extpass.clone();
    opts.config_path = cli.config.clone();

    if cli.standard {
        opts.config_mode = ConfigMode::Standard;
    }
    if cli.paranoia {
        opts.config_mode = ConfigMode::Paranoia;
    }

    if cli.reverse {
        // Reverse views are read-only unless writes were asked for
        // explicitly. The kernel metadata caches stay enabled; use
        // --nocache when the backing tree changes behind the mount.
        opts.reverse_encryption = true;
        opts.read_only = true;
    }
    if cli.reversewrite {
        opts.reverse_encryption = true;
        opts.read_only = false;
    }

    if cli.nocache || cli.noattrcache {
        // Stale kernel attribute or entry data defeats the point of
        // disabling the overlay caches.
        forwarded.push_opt("attr_timeout=0");
        forwarded.push_opt("entry_timeout=0");
    }
    if cli.nocache || cli.nodatacache {
        opts.no_cache = true;
    }

    if cli.public {
        if ctx.euid_is_root {
            opts.owner_create = true;
            forwarded.push_opt("allow_other");
        } else {
            tracing::warn!("option '--public' ignored for non-root user");
        }
    }

    for opt in &cli.mount_options {
        forwarded.push_opt(opt);
    }

    if !is_threaded {
        forwarded.push("-s");
    }

    // For --unmount exactly one argument is expected: the mount point.
    if opts.unmount {
        if cli.args.len() != 1 {
            return Err(ConfigError::MissingArguments(
                "Expecting one argument, aborting.".to_string(),
            ));
        }
        // Kept exactly as the user gave it; the host unmount facility
        // resolves it.
        opts.unmount_target = cli.args[0].clone();
        return Ok(SessionConfig {
            is_daemon,
            is_threaded,
            is_verbose: cli.verbose,
            fuse_debug: cli.fuse_debug,
            idle_timeout_minutes,
            syslog_tag: cli.syslog_tag.clone(),
            forwarded,
            opts,
        });
    }

    if cli.args.len() < 2 {
        return Err(ConfigError::MissingArguments(
            "Missing one or more arguments, aborting.".to_string(),
        ));
    }

    // Both paths are slash-terminated for uniform prefix comparisons.
    opts.root_dir = slash_terminate(&cli.args[0]);
    opts.unmount_target = cli.args[1].clone();
    opts.mount_point = slash_terminate(&cli.args[1]);

    // Anything left over is forwarded to the mount interface untouched.
    for extra in &cli.args[2..] {
        forwarded.push(extra.clone());
    }

    if !cli.no_default_flags {
        // Expose the backing store's stable inode numbers.
        forwarded.push_opt("use_ino");
        // Kernel-side permission enforcement; pass-through modes are
        // otherwise only checked by the backing store on raw access.
        forwarded.push_opt("default_permissions");
        #[cfg(target_os = "macos")]
        {
            // Selects the local-volume presentation in Finder.
            forwarded.push_opt("local");
        }
    }

    if is_daemon
        && (!opts.mount_point.starts_with('/') || !opts.root_dir.starts_with('/'))
    {
        return Err(ConfigError::InvalidPathConfiguration(
            "When specifying daemon mode, you must use absolute paths (beginning with '/')"
                .to_string(),
        ));
    }

    if opts.root_dir.starts_with(&opts.mount_point) {
        return Err(ConfigError::InvalidPathConfiguration(
            "The raw directory may not be a subdirectory of the mount point.".to_string(),
        ));
    }

    if opts.delay_mount && !opts.mount_on_demand {
        return Err(ConfigError::InvalidModeCombination(
            "You must use mount-on-demand with delay-mount".to_string(),
        ));
    }

    if opts.mount_on_demand
        && opts
            .password_program
            .as_deref()
            .unwrap_or("")
            .is_empty()
    {
        return Err(ConfigError::InvalidModeCombination(
            "Must set password program when using mount-on-demand".to_string(),
        ));
    }

    if !ctx.dirs.ensure_dir(DirRole::Root, opts.root_dir_path()) {
        return Err(ConfigError::PathUnavailable(
            "Unable to locate root directory, aborting.".to_string(),
        ));
    }

    if !ctx.dirs.ensure_dir(DirRole::MountPoint, opts.mount_point_path()) {
        return Err(ConfigError::PathUnavailable(
            "Unable to locate mount point, aborting.".to_string(),
        ));
    }

    // The reserved slot is filled only once validation has succeeded.
    forwarded.set_mount_point(&opts.mount_point);

    Ok(SessionConfig {
        is_daemon,
        is_threaded,
        is_verbose: cli.verbose,
        fuse_debug: cli.fuse_debug,
        idle_timeout_minutes,
        syslog_tag: cli.syslog_tag.clone(),
        forwarded,
        opts,
    })
}

/// Prints the full usage text to stderr.
pub fn print_usage() {
    let mut cmd = Cli::command();
    let _ = cmd.print_help();
}

/// Prints the mount-interface options understood by the forwarded-option
/// translator.
pub fn print_interface_help() {
    println!("veilfs [options] rootDir mountPoint -- [mount interface options]");
    println!("recognized -o options (all others pass through verbatim):");
    for name in [
        "allow_other",
        "allow_root",
        "auto_unmount",
        "default_permissions",
        "ro",
        "rw",
        "exec / noexec",
        "suid / nosuid",
        "dev / nodev",
        "atime / noatime",
        "dirsync",
        "sync / async",
    ] {
        println!("  -o {name}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Policy that accepts existing directories only, never creating.
    struct ExistingOnly;

    impl DirSetup for ExistingOnly {
        fn ensure_dir(&self, _role: DirRole, path: &Path) -> bool {
            path.is_dir()
        }
    }

    /// Policy that accepts everything without touching the filesystem.
    struct AcceptAll;

    impl DirSetup for AcceptAll {
        fn ensure_dir(&self, _role: DirRole, _path: &Path) -> bool {
            true
        }
    }

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).expect("argv should parse")
    }

    fn ctx<'a>(dirs: &'a dyn DirSetup) -> ValidationCtx<'a> {
        ValidationCtx {
            euid_is_root: false,
            dirs,
        }
    }

    #[test]
    fn plain_mount_uses_the_documented_defaults() {
        let cli = parse(&["veilfs", "/data/", "/mnt/crypt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");

        assert!(config.is_daemon);
        assert!(config.is_threaded);
        assert!(!config.is_verbose);
        assert_eq!(config.idle_timeout_minutes, 0);
        assert!(config.opts.check_key);
        assert!(!config.opts.idle_tracking);
        assert_eq!(config.opts.root_dir, "/data/");
        assert_eq!(config.opts.mount_point, "/mnt/crypt/");
        assert_eq!(config.opts.unmount_target, "/mnt/crypt");

        // Baseline forwarded options are appended after user options.
        assert_eq!(config.forwarded.count_opt("use_ino"), 1);
        assert_eq!(config.forwarded.count_opt("default_permissions"), 1);
        #[cfg(target_os = "macos")]
        assert_eq!(config.forwarded.count_opt("local"), 1);

        // Mount point fills the reserved slot last.
        assert_eq!(config.forwarded.tokens()[1], "/mnt/crypt/");
    }

    #[test]
    fn no_default_flags_suppresses_the_baseline() {
        let cli = parse(&["veilfs", "-N", "/data", "/mnt/crypt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert_eq!(config.forwarded.count_opt("use_ino"), 0);
        assert_eq!(config.forwarded.count_opt("default_permissions"), 0);
    }

    #[test]
    fn paths_are_slash_terminated_and_disjoint() {
        let cli = parse(&["veilfs", "/data", "/mnt/crypt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(config.opts.root_dir.ends_with('/'));
        assert!(config.opts.mount_point.ends_with('/'));
        assert!(!config.opts.root_dir.starts_with(&config.opts.mount_point));
    }

    #[test]
    fn root_inside_mount_point_is_rejected() {
        let cli = parse(&["veilfs", "/mnt/crypt/backing", "/mnt/crypt"]);
        let err = build_config(&cli, "veilfs", &ctx(&AcceptAll)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPathConfiguration(_)));
    }

    #[test]
    fn daemon_mode_requires_absolute_paths() {
        let cli = parse(&["veilfs", "data", "mnt"]);
        let err = build_config(&cli, "veilfs", &ctx(&AcceptAll)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPathConfiguration(_)));

        // Foreground mode accepts relative paths.
        let cli = parse(&["veilfs", "-f", "data", "mnt"]);
        assert!(build_config(&cli, "veilfs", &ctx(&AcceptAll)).is_ok());
    }

    #[test]
    fn delaymount_without_ondemand_is_a_mode_conflict_not_a_path_error() {
        // Directories that do not exist: the mode conflict must still win.
        let cli = parse(&["veilfs", "--delaymount", "/no/such/data", "/no/such/mnt"]);
        let err = build_config(&cli, "veilfs", &ctx(&ExistingOnly)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidModeCombination(_)));
    }

    #[test]
    fn ondemand_without_password_program_is_a_mode_conflict() {
        let cli = parse(&["veilfs", "--ondemand", "/data", "/mnt"]);
        let err = build_config(&cli, "veilfs", &ctx(&AcceptAll)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidModeCombination(_)));
    }

    #[test]
    fn ondemand_with_password_program_passes_the_mode_checks() {
        let cli = parse(&[
            "veilfs",
            "--ondemand",
            "--extpass=/usr/bin/askpass",
            "/data",
            "/mnt",
        ]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(config.opts.mount_on_demand);
        assert_eq!(
            config.opts.password_program.as_deref(),
            Some("/usr/bin/askpass")
        );
    }

    #[test]
    fn public_without_privilege_is_ignored() {
        let cli = parse(&["veilfs", "--public", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(!config.opts.owner_create);
        assert_eq!(config.forwarded.count_opt("allow_other"), 0);
    }

    #[test]
    fn public_with_privilege_enables_owner_create() {
        let cli = parse(&["veilfs", "--public", "/data", "/mnt"]);
        let ctx = ValidationCtx {
            euid_is_root: true,
            dirs: &AcceptAll,
        };
        let config = build_config(&cli, "veilfs", &ctx).expect("valid");
        assert!(config.opts.owner_create);
        assert_eq!(config.forwarded.count_opt("allow_other"), 1);
    }

    #[test]
    fn unmount_takes_exactly_one_argument() {
        let cli = parse(&["veilfs", "-u", "/mnt/crypt"]);
        let config = build_config(&cli, "veilfs", &ctx(&ExistingOnly)).expect("valid");
        assert!(config.opts.unmount);
        assert!(!config.is_daemon);
        assert_eq!(config.opts.unmount_target, "/mnt/crypt");

        let cli = parse(&["veilfs", "-u", "/mnt/a", "/mnt/b"]);
        let err = build_config(&cli, "veilfs", &ctx(&ExistingOnly)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingArguments(_)));
    }

    #[test]
    fn mount_needs_two_positional_arguments() {
        let cli = parse(&["veilfs", "/data"]);
        let err = build_config(&cli, "veilfs", &ctx(&AcceptAll)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingArguments(_)));
    }

    #[test]
    fn extra_positionals_are_forwarded_verbatim() {
        let cli = parse(&["veilfs", "/data", "/mnt", "--", "-o", "max_read=4096"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert_eq!(config.forwarded.count_opt("max_read=4096"), 1);
    }

    #[test]
    fn idle_flag_enables_idle_tracking() {
        let cli = parse(&["veilfs", "-i", "30", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert_eq!(config.idle_timeout_minutes, 30);
        assert!(config.opts.idle_tracking);
        assert!(config.idle_monitor_enabled());
    }

    #[test]
    fn single_thread_forwards_the_hint() {
        let cli = parse(&["veilfs", "-s", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(!config.is_threaded);
        assert!(config.forwarded.tokens().contains(&"-s".to_string()));
    }

    #[test]
    fn cache_tiers_forward_the_kernel_cache_disables() {
        let cli = parse(&["veilfs", "--nocache", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(config.opts.no_cache);
        assert_eq!(config.forwarded.count_opt("attr_timeout=0"), 1);
        assert_eq!(config.forwarded.count_opt("entry_timeout=0"), 1);

        let cli = parse(&["veilfs", "--noattrcache", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(!config.opts.no_cache);
        assert_eq!(config.forwarded.count_opt("attr_timeout=0"), 1);

        let cli = parse(&["veilfs", "--nodatacache", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(config.opts.no_cache);
        assert_eq!(config.forwarded.count_opt("attr_timeout=0"), 0);
    }

    #[test]
    fn reverse_forces_read_only_but_reversewrite_does_not() {
        let cli = parse(&["veilfs", "--reverse", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(config.opts.reverse_encryption);
        assert!(config.opts.read_only);

        let cli = parse(&["veilfs", "--reversewrite", "/data", "/mnt"]);
        let config = build_config(&cli, "veilfs", &ctx(&AcceptAll)).expect("valid");
        assert!(config.opts.reverse_encryption);
        assert!(!config.opts.read_only);
    }

    #[test]
    fn missing_directories_fail_validation_under_a_refusing_policy() {
        let cli = parse(&["veilfs", "/no/such/data", "/no/such/mnt"]);
        let err = build_config(&cli, "veilfs", &ctx(&ExistingOnly)).unwrap_err();
        assert!(matches!(err, ConfigError::PathUnavailable(_)));
    }

    #[test]
    fn existing_directories_pass_the_existing_only_policy() {
        let root = tempfile::tempdir().expect("tempdir");
        let mount = tempfile::tempdir().expect("tempdir");
        let root_arg = root.path().to_str().expect("utf8").to_string();
        let mount_arg = mount.path().to_str().expect("utf8").to_string();

        let cli = parse(&["veilfs", &root_arg, &mount_arg]);
        let config = build_config(&cli, "veilfs", &ctx(&ExistingOnly)).expect("valid");
        assert_eq!(config.opts.root_dir, format!("{root_arg}/"));
    }

    #[test]
    fn unknown_options_abort_at_the_surface() {
        assert!(Cli::try_parse_from(["veilfs", "--no-such-flag", "/a", "/b"]).is_err());
        assert!(Cli::try_parse_from(["veilfs", "-i"]).is_err());
    }
}
