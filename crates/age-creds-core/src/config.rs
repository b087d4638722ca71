//! Configuration types and loading for systemd-age-creds.
//!
//! The daemon is configured from three layers, highest precedence first:
//! command-line flags, environment variables (both handled by the binary and
//! passed in as [`Overrides`]), and an optional TOML file ([`FileConfig`]).
//! [`Config::resolve`] merges them into one immutable [`Config`] that the
//! server owns for the rest of the process lifetime.
//!
//! # Error Handling
//!
//! - A config file that was asked for but cannot be read is an error.
//! - A config file that exists but is invalid is an error (fail fast).
//! - A missing credentials directory or identity is an error.
//!
//! # Example Configuration
//!
//! ```toml
//! [age]
//! bin = "/usr/bin/age"
//! identity = "/etc/age/host.key"
//! dir = "/etc/credstore.age"
//!
//! [server]
//! accept_timeout = "10s"
//! idle_timeout = "5m"
//! ```

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::traits::ActivationError;

/// The first file descriptor passed by systemd (SD_LISTEN_FDS_START).
pub const SD_LISTEN_FDS_START: RawFd = 3;

/// File name systemd gives the descriptor of an `Accept=yes` socket unit.
pub const CONNECTION_FD_NAME: &str = "connection";

/// Extension of encrypted credential files in the store directory.
pub const CREDENTIAL_EXTENSION: &str = "age";

/// Default bound on one request, from accept to close.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A duration setting is not a valid humantime string.
    #[error("invalid duration {value:?} for {field}: {source}")]
    Duration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("missing credentials directory")]
    MissingDir,

    #[error("missing age identity file")]
    MissingIdentity,

    #[error("no age binary configured and none found on PATH")]
    MissingAgeBin,
}

/// How the activated descriptor is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The descriptor is a connection systemd already accepted; serve it and exit.
    Accept,
    /// The descriptor is a listening socket; serve connections until shutdown.
    Listen,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Accept => write!(f, "accept"),
            Mode::Listen => write!(f, "listen"),
        }
    }
}

/// Socket activation metadata handed down by the service manager.
///
/// Mirrors `LISTEN_PID`, `LISTEN_FDS_START`, `LISTEN_FDS` and
/// `LISTEN_FDNAMES`. The binary reads these once and removes them from the
/// environment; nothing else in the process consults the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationContext {
    /// PID the descriptors were intended for.
    pub pid: u32,
    /// First inherited descriptor.
    pub fds_start: RawFd,
    /// Number of inherited descriptors.
    pub fds: usize,
    /// Colon-separated descriptor names.
    pub fd_names: String,
}

impl Default for ActivationContext {
    fn default() -> Self {
        Self {
            pid: 0,
            fds_start: SD_LISTEN_FDS_START,
            fds: 0,
            fd_names: String::new(),
        }
    }
}

impl ActivationContext {
    /// Build a context describing one descriptor handed to this very process.
    pub fn for_current_process(fd: RawFd, name: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            fds_start: fd,
            fds: 1,
            fd_names: name.into(),
        }
    }

    /// Check that the context hands exactly one named descriptor to
    /// `current_pid`, and return that name.
    pub fn validate(&self, current_pid: u32) -> Result<&str, ActivationError> {
        if self.pid != current_pid {
            return Err(ActivationError::PidMismatch {
                listen_pid: self.pid,
                current: current_pid,
            });
        }

        if self.fds != 1 {
            return Err(ActivationError::FdCount(self.fds));
        }

        let mut names = self.fd_names.split(':');
        match (names.next(), names.next()) {
            (Some(name), None) if !name.is_empty() => Ok(name),
            _ => Err(ActivationError::FdNames(self.fd_names.clone())),
        }
    }

    /// Whether the single descriptor is an already-accepted connection.
    pub fn is_connection(&self) -> bool {
        self.fd_names == CONNECTION_FD_NAME
    }
}

/// Top-level TOML configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub age: AgeSection,
    pub server: ServerSection,
}

/// `[age]` section: where the decryption tool and its inputs live.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AgeSection {
    /// Path to the `age` binary.
    pub bin: Option<PathBuf>,
    /// Path to the age identity file.
    pub identity: Option<PathBuf>,
    /// Directory holding `<credential>.age` files.
    pub dir: Option<PathBuf>,
}

/// `[server]` section: timeouts as humantime strings (`"10s"`, `"1m30s"`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub accept_timeout: Option<String>,
    pub idle_timeout: Option<String>,
}

impl FileConfig {
    /// Load configuration from a specific path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Values supplied on the command line or through the environment.
///
/// `None` means "not given"; the file or the built-in default applies.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub age_bin: Option<PathBuf>,
    pub identity: Option<PathBuf>,
    pub dir: Option<PathBuf>,
    pub accept_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// Force accept mode even if the descriptor name does not say so.
    pub accept: bool,
}

/// Immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the `age` binary.
    pub age_bin: PathBuf,
    /// Directory holding `<credential>.age` files.
    pub dir: PathBuf,
    /// Identity passed to `age --identity`.
    pub identity: PathBuf,
    /// Per-connection deadline; zero disables it.
    pub accept_timeout: Duration,
    /// Exit after this long without a new connection; zero disables it.
    pub idle_timeout: Duration,
    pub mode: Mode,
    pub activation: ActivationContext,
}

impl Config {
    /// Merge overrides, file settings and defaults into a validated config.
    ///
    /// An `age` binary that is configured nowhere is looked up on `PATH`.
    pub fn resolve(
        file: FileConfig,
        overrides: Overrides,
        activation: ActivationContext,
    ) -> Result<Self, ConfigError> {
        let dir = overrides
            .dir
            .or(file.age.dir)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::MissingDir)?;

        let identity = overrides
            .identity
            .or(file.age.identity)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::MissingIdentity)?;

        let age_bin = overrides
            .age_bin
            .or(file.age.bin)
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| which::which("age").ok())
            .ok_or(ConfigError::MissingAgeBin)?;

        let accept_timeout = match overrides.accept_timeout {
            Some(d) => d,
            None => match file.server.accept_timeout.as_deref() {
                Some(s) => parse_duration("accept_timeout", s)?,
                None => DEFAULT_ACCEPT_TIMEOUT,
            },
        };

        let idle_timeout = match overrides.idle_timeout {
            Some(d) => d,
            None => match file.server.idle_timeout.as_deref() {
                Some(s) => parse_duration("idle_timeout", s)?,
                None => Duration::ZERO,
            },
        };

        let mode = if overrides.accept || activation.is_connection() {
            Mode::Accept
        } else {
            Mode::Listen
        };

        Ok(Self {
            age_bin,
            dir,
            identity,
            accept_timeout,
            idle_timeout,
            mode,
            activation,
        })
    }

    /// The per-connection deadline, if one is configured.
    pub fn connection_timeout(&self) -> Option<Duration> {
        (!self.accept_timeout.is_zero()).then_some(self.accept_timeout)
    }

    /// The idle exit interval, if one is configured.
    pub fn idle_exit(&self) -> Option<Duration> {
        (!self.idle_timeout.is_zero()).then_some(self.idle_timeout)
    }

    /// Path of the encrypted file backing `credential_id`.
    pub fn credential_path(&self, credential_id: &str) -> PathBuf {
        credential_path(&self.dir, credential_id)
    }
}

/// `<dir>/<credential_id>.age`.
pub fn credential_path(dir: &Path, credential_id: &str) -> PathBuf {
    dir.join(format!("{credential_id}.{CREDENTIAL_EXTENSION}"))
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|source| ConfigError::Duration {
        field,
        value: value.to_string(),
        source,
    })
}
