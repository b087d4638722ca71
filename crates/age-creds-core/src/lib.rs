//! Core types and utilities for systemd-age-creds.
//!
//! This crate holds the parts of the credential broker that need no OS
//! resources: configuration, request decoding from the peer address, and the
//! decryption seam. The daemon crate wires them to sockets and subprocesses.
//!
//! # Modules
//!
//! - [`config`]: Immutable daemon configuration and socket activation metadata
//! - [`peer`]: Peer address parsing (`PeerRequest`) and `PeerCredentials`
//! - [`traits`]: The `Decryptor` seam and the activation/decryption errors
//!
//! # Example
//!
//! ```
//! use age_creds_core::{config::credential_path, parse_peer_name};
//! use std::path::Path;
//!
//! let request = parse_peer_name("@0123abcd/unit/nginx.service/tls-key").unwrap();
//! let path = credential_path(Path::new("/etc/credstore.age"), &request.credential_id);
//! assert_eq!(path, Path::new("/etc/credstore.age/tls-key.age"));
//! ```

pub mod config;
pub mod peer;
pub mod traits;

// Re-export commonly used types at the crate root for convenience
pub use config::{ActivationContext, Config, ConfigError, FileConfig, Mode, Overrides};
pub use peer::{parse_peer_name, ParseError, PeerCredentials, PeerRequest};
pub use traits::{ActivationError, DecryptError, Decryptor};
