//! CLI bootstrap for the jiufeng message dispatcher (`spec.md §6`):
//! argument parsing, logging, the working-directory/sentinel environment
//! contract, and wiring the allocator stack to the dispatcher before
//! handing control to the reactor loop.

mod cli;
mod daemonize;
mod logging;
mod sentinel;
mod settings;
mod shutdown;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use dispatcher::{Dispatcher, DispatcherConfig};
use jiukun_buddy::BuddyParams;
use jiukun_slab::Jiukun;

/// Default allocator sizing for the daemon process: zones of
/// `2^DEFAULT_MAX_ORDER` pages, growable on demand. Not exposed on the CLI
/// or settings file — `spec.md §6` only documents the daemon's CLI/env
/// contract, not allocator tuning knobs.
const DEFAULT_MAX_ORDER: u32 = 12;

/// How long `stop()` waits for subscriber queues to drain before forcing
/// the reactor closed (`spec.md §4.D`).
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error("could not determine or enter the executable's directory: {0}")]
    WorkingDir(std::io::Error),

    #[error("could not initialize logging: {0}")]
    Logging(std::io::Error),

    #[error(transparent)]
    Settings(#[from] settings::SettingsError),

    #[error(transparent)]
    Sentinel(#[from] sentinel::SentinelError),

    #[error("could not create socket directory {0}: {1}")]
    SocketDir(std::path::PathBuf, std::io::Error),

    #[error(transparent)]
    Dispatcher(#[from] dispatcher::DispatcherError),

    #[error("failed to detach from the controlling terminal: {0}")]
    Daemonize(#[from] nix::Error),

    #[error("reactor loop exited with an error: {0}")]
    Run(std::io::Error),
}

fn main() -> ExitCode {
    let args = cli::Args::parse();

    if args.version {
        println!("{}", cli::VERSION_STRING);
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("jiufengd: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &cli::Args) -> Result<(), DaemonError> {
    // Logging is installed before anything else can fail, so every
    // subsequent step's errors are both logged and, via `DaemonError`'s
    // `Display`, echoed to stderr by `main`.
    let _log_guard = logging::init(args.log_level, args.log_file.as_deref(), args.log_file_size)
        .map_err(DaemonError::Logging)?;

    let exe_dir = std::env::current_exe()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "executable has no parent directory")
        }))
        .map_err(DaemonError::WorkingDir)?;
    std::env::set_current_dir(&exe_dir).map_err(DaemonError::WorkingDir)?;
    tracing::info!(dir = %exe_dir.display(), "working directory set to executable directory");

    let config = match &args.settings {
        Some(path) => settings::load(path)?,
        None => DispatcherConfig::default(),
    };

    std::fs::create_dir_all(&config.socket_dir)
        .map_err(|e| DaemonError::SocketDir(config.socket_dir.clone(), e))?;

    let sentinel_path = config.socket_dir.join("jiufengd.lock");
    let _sentinel = sentinel::acquire(&sentinel_path)?;
    tracing::info!(path = %sentinel_path.display(), "sentinel lock acquired");

    if !args.foreground {
        daemonize::daemonize()?;
        tracing::info!("detached from controlling terminal");
    }

    let pool = Jiukun::new(BuddyParams {
        max_order: DEFAULT_MAX_ORDER,
        no_grow: false,
    });

    let dispatcher = Dispatcher::new(&config, pool)?;
    let stop = dispatcher.stop_handle();
    shutdown::install(stop, SHUTDOWN_DRAIN_TIMEOUT).map_err(DaemonError::Daemonize)?;

    tracing::info!("dispatcher starting");
    dispatcher.run().map_err(DaemonError::Run)
}
