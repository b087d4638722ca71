//! systemd-age-creds daemon implementation.
//!
//! This crate serves age-encrypted credentials to systemd units over a
//! socket-activated Unix socket. A unit asks for a credential simply by
//! connecting: systemd binds the client end to
//! `@<random>/unit/<unit>/<credential>`, and the daemon answers with the
//! decrypted bytes and closes.
//!
//! Note: decryption is delegated to the `age` tool; this crate only brokers
//! requests to it.

pub mod activation;
pub mod daemon;
pub mod decrypt;
pub mod handler;
pub mod identity;
pub mod idle;

#[cfg(test)]
mod testutil;

// Re-export main components
pub use activation::{claim_connection, claim_listener};
pub use daemon::{Daemon, DaemonError, Phase};
pub use decrypt::AgeDecryptor;
pub use handler::{handle_connection, ConnectionError};
