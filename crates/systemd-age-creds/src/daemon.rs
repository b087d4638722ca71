//! Main daemon orchestration.
//!
//! This module provides the `Daemon` struct that owns the activated socket
//! and runs it in one of two modes:
//!
//! - Accept mode: systemd accepted the connection (`Accept=yes`); serve it
//!   and return its result.
//! - Listen mode: accept connections until shutdown, serving each one on its
//!   own task.
//!
//! In listen mode the daemon moves through `Starting -> Listening ->
//! Draining -> Stopped`. SIGTERM/SIGINT and the idle timer both cancel the
//! same token, which ends accepting. Connections already dispatched then run
//! to completion (or their own deadline) before the daemon reports stopped.

use std::io;
use std::sync::Arc;

use age_creds_core::{ActivationError, Config, Decryptor, Mode};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::activation;
use crate::decrypt::AgeDecryptor;
use crate::handler::{handle_connection, ConnectionError};
use crate::idle::IdleTimer;

/// Lifecycle phase of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Claiming the activated socket.
    Starting,
    /// Accepting connections.
    Listening,
    /// No longer accepting; waiting for in-flight connections.
    Draining,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Starting => write!(f, "starting"),
            Phase::Listening => write!(f, "listening"),
            Phase::Draining => write!(f, "draining"),
            Phase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Error type for a daemon run.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The activated socket could not be claimed.
    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// Accepting failed for a reason other than shutdown.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The single connection of accept mode failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// The main daemon struct.
pub struct Daemon<D: Decryptor> {
    config: Arc<Config>,
    decryptor: Arc<D>,
    phase: watch::Sender<Phase>,
}

impl Daemon<AgeDecryptor> {
    /// Create a daemon that decrypts with the configured `age` binary.
    pub fn new(config: Config) -> Self {
        let decryptor = AgeDecryptor::from_config(&config);
        Self::with_decryptor(config, decryptor)
    }
}

impl<D: Decryptor + 'static> Daemon<D> {
    /// Create a daemon with a custom decryption backend.
    pub fn with_decryptor(config: Config, decryptor: D) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            config: Arc::new(config),
            decryptor: Arc::new(decryptor),
            phase,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Observe lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run until the work of the configured mode is done.
    ///
    /// Cancelling `shutdown` stops a listen-mode daemon from accepting; it
    /// still waits for dispatched connections before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        info!(mode = %self.config.mode, "Daemon starting");
        let result = match self.config.mode {
            Mode::Accept => self.serve_connection(&shutdown).await,
            Mode::Listen => self.serve_listener(shutdown.child_token()).await,
        };
        self.set_phase(Phase::Stopped);
        result
    }

    /// Serve the single accepted connection.
    ///
    /// A shutdown request is logged but the request still completes, bounded
    /// only by the connection deadline.
    async fn serve_connection(&self, shutdown: &CancellationToken) -> Result<(), DaemonError> {
        let stream = activation::claim_connection(&self.config.activation)?;
        let handled =
            handle_connection(stream, self.decryptor.as_ref(), self.config.connection_timeout());
        tokio::pin!(handled);

        let result = tokio::select! {
            result = &mut handled => result,
            () = shutdown.cancelled() => {
                info!(
                    deadline = ?self.config.connection_timeout(),
                    "Shutdown requested, finishing the accepted connection first"
                );
                handled.await
            }
        };
        result?;
        Ok(())
    }

    async fn serve_listener(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let listener = activation::claim_listener(&self.config.activation)?;
        let mut idle = IdleTimer::new(self.config.idle_exit());
        let mut tasks = JoinSet::new();

        info!(
            address = ?listener.local_addr().ok(),
            idle_timeout = ?self.config.idle_exit(),
            "Listening for credential requests"
        );
        self.set_phase(Phase::Listening);

        let accept_error = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break None,

                () = idle.expired() => {
                    info!(timeout = ?self.config.idle_exit(), "Idle timeout reached");
                    shutdown.cancel();
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        idle.reset();
                        self.dispatch(&mut tasks, stream);
                    }
                    Err(_) if shutdown.is_cancelled() => break None,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        break Some(e);
                    }
                },
            }

            while let Some(finished) = tasks.try_join_next() {
                log_task_exit(finished);
            }
        };

        drop(listener);
        self.set_phase(Phase::Draining);
        info!(in_flight = tasks.len(), "Shutting down listener");

        while let Some(finished) = tasks.join_next().await {
            log_task_exit(finished);
        }

        match accept_error {
            Some(e) => Err(DaemonError::Accept(e)),
            None => Ok(()),
        }
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, stream: UnixStream) {
        let decryptor = Arc::clone(&self.decryptor);
        let timeout = self.config.connection_timeout();

        tasks.spawn(async move {
            if let Err(e) = handle_connection(stream, decryptor.as_ref(), timeout).await {
                error!(error = %e, "Connection failed");
            }
        });
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
        debug!(phase = %phase, "Daemon phase changed");
    }
}

fn log_task_exit(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        error!(error = %e, "Connection task aborted");
    }
}
