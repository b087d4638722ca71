//! systemd-age-creds - Main entry point.
//!
//! Runs under a systemd socket unit and answers `LoadCredential=` requests
//! with the plaintext of `<dir>/<credential>.age`.
//!
//! # Architecture
//!
//! - `main` reads flags, environment and the optional config file once,
//!   removes the consumed variables from the environment, and sets up logging
//! - The tokio runtime is started afterwards, so nothing else observes the
//!   environment while it is being modified
//! - SIGTERM/SIGINT cancel the daemon's shutdown token

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use age_creds_core::config::SD_LISTEN_FDS_START;
use age_creds_core::{ActivationContext, Config, FileConfig, Overrides};
use age_credsd::Daemon;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variables read through clap and removed after parsing.
const CONSUMED_ENV: &[&str] = &[
    "AGE_BIN",
    "AGE_DIR",
    "AGE_IDENTITY",
    "AGE_ACCEPT_TIMEOUT",
    "AGE_IDLE_TIMEOUT",
    "LISTEN_PID",
    "LISTEN_FDS",
    "LISTEN_FDS_START",
    "LISTEN_FDNAMES",
];

/// Socket-activated broker for age-encrypted systemd credentials.
#[derive(Parser)]
#[command(name = "systemd-age-creds")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the age binary [default: looked up on PATH]
    #[arg(long, value_name = "PATH", env = "AGE_BIN")]
    age_bin: Option<PathBuf>,

    /// Directory holding <credential>.age files
    #[arg(long, value_name = "DIR", env = "AGE_DIR")]
    dir: Option<PathBuf>,

    /// Identity file passed to `age --identity`
    #[arg(long, value_name = "PATH", env = "AGE_IDENTITY")]
    identity: Option<PathBuf>,

    /// Deadline for each connection, e.g. "10s" (0 disables) [default: 10s]
    #[arg(long, value_name = "DURATION", env = "AGE_ACCEPT_TIMEOUT", value_parser = humantime::parse_duration)]
    accept_timeout: Option<Duration>,

    /// Exit after this long without a connection (0 disables) [default: 0s]
    #[arg(long, value_name = "DURATION", env = "AGE_IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Serve the inherited descriptor as one accepted connection
    #[arg(long)]
    accept: bool,

    /// PID the activated descriptors are meant for
    #[arg(long, value_name = "PID", env = "LISTEN_PID")]
    listen_pid: Option<u32>,

    /// Number of activated descriptors
    #[arg(long, value_name = "N", env = "LISTEN_FDS", default_value_t = 0)]
    listen_fds: usize,

    /// First activated descriptor
    #[arg(long, value_name = "FD", env = "LISTEN_FDS_START", default_value_t = SD_LISTEN_FDS_START)]
    listen_fds_start: i32,

    /// Colon-separated names of the activated descriptors
    #[arg(long, value_name = "NAMES", env = "LISTEN_FDNAMES", default_value = "")]
    listen_fdnames: String,

    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            age_bin: self.age_bin.clone(),
            identity: self.identity.clone(),
            dir: self.dir.clone(),
            accept_timeout: self.accept_timeout,
            idle_timeout: self.idle_timeout,
            accept: self.accept,
        }
    }

    fn activation(&self) -> ActivationContext {
        ActivationContext {
            pid: self.listen_pid.unwrap_or(0),
            fds_start: self.listen_fds_start,
            fds: self.listen_fds,
            fd_names: self.listen_fdnames.clone(),
        }
    }
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // JOURNAL_STREAM is set when stderr is connected to the journal
    if std::env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter)
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Still single-threaded: the runtime is built below.
    for var in CONSUMED_ENV {
        std::env::remove_var(var);
    }

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    setup_logging(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting systemd-age-creds"
    );

    let file = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            FileConfig::load_from(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => {
            debug!("No config file given, using flags and environment only");
            FileConfig::default()
        }
    };
    let config = Config::resolve(file, cli.overrides(), cli.activation())
        .context("Invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    runtime.block_on(run_daemon(config))
}

/// Run the daemon until its mode's work is done or a signal arrives.
async fn run_daemon(config: Config) -> Result<()> {
    info!(
        mode = %config.mode,
        dir = %config.dir.display(),
        identity = %config.identity.display(),
        age = %config.age_bin.display(),
        accept_timeout = ?config.connection_timeout(),
        idle_timeout = ?config.idle_exit(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    forward_signals(shutdown.clone())?;

    let daemon = Daemon::new(config);
    if let Err(e) = daemon.run(shutdown).await {
        error!(error = %e, "Daemon error");
        return Err(e.into());
    }

    info!("Stopping systemd-age-creds");
    Ok(())
}

/// Cancel `shutdown` on the first SIGTERM or SIGINT.
fn forward_signals(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            () = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}
