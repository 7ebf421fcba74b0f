use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use veilfs_fuse::args::{self, Cli, InteractiveDirSetup, ValidationCtx};
use veilfs_fuse::config::SessionConfig;
use veilfs_fuse::driver;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version renders exit cleanly; real parse errors
            // carry the usage diagnostic.
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    if cli.version {
        println!("veilfs version {}", env!("CARGO_PKG_VERSION"));
        if cli.verbose {
            println!("built with the fuser mount interface");
        }
        return ExitCode::SUCCESS;
    }

    if cli.fuse_help {
        args::print_interface_help();
        return ExitCode::SUCCESS;
    }

    let dirs = InteractiveDirSetup {
        annotate: cli.annotate,
    };
    let ctx = ValidationCtx {
        euid_is_root: effective_uid_is_root(),
        dirs: &dirs,
    };
    let program = program_name();

    let config = match args::build_config(&cli, &program, &ctx) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            eprintln!();
            args::print_usage();
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    if config.opts.unmount {
        return match driver::run_unmount(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    match driver::run_session(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or("veilfs")
        .to_string()
}

#[cfg(unix)]
fn effective_uid_is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn effective_uid_is_root() -> bool {
    false
}

/// Sets up tracing: stderr in the foreground, a rolling session-log file
/// named by the syslog tag when daemonizing.
fn init_logging(config: &SessionConfig) {
    // -d pulls in the interface layer's own tracing (fuser logs through
    // the log bridge the fmt subscriber installs).
    let default_filter = if config.fuse_debug {
        "trace"
    } else if config.is_verbose {
        "debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.is_daemon {
        let log_dir = session_log_dir();
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "warning: cannot create log directory {}: {e}; logging to stderr",
                log_dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            return;
        }

        // The appender is used directly, without the non-blocking worker:
        // daemonizing forks, and a writer thread would not survive it.
        let appender = tracing_appender::rolling::RollingFileAppender::new(
            tracing_appender::rolling::Rotation::DAILY,
            &log_dir,
            format!("{}.log", config.syslog_tag),
        );
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(appender))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn session_log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("veilfs").join("logs");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("veilfs")
                .join("logs");
        }
    }
    std::env::temp_dir().join("veilfs").join("logs")
}
