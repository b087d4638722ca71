//! Caller identity carried by a credential request.
//!
//! systemd's `LoadCredential=` connects to the broker from a socket bound to
//! the abstract address `@<random>/unit/<unit>/<credential>`. That address is
//! the whole request: there is no request body.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static PEER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*/unit/([^/]+)/([^/]+)$").expect("peer name pattern is valid")
});

/// The peer address did not encode a unit and credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid peer name: {address:?}")]
pub struct ParseError {
    /// The offending address, as rendered from the socket.
    pub address: String,
}

/// A credential request decoded from the peer's socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    /// Unit the credential is being loaded for, e.g. `nginx.service`.
    pub unit_name: String,
    /// Name of the requested credential.
    pub credential_id: String,
}

/// Parse `<prefix>/unit/<unit>/<credential>`.
///
/// The match is anchored at both ends. Neither captured segment may be empty
/// or contain `/`.
///
/// ```
/// use age_creds_core::peer::parse_peer_name;
///
/// let req = parse_peer_name("@f4b4692a71d9438e/unit/nginx.service/tls-key").unwrap();
/// assert_eq!(req.unit_name, "nginx.service");
/// assert_eq!(req.credential_id, "tls-key");
/// ```
pub fn parse_peer_name(address: &str) -> Result<PeerRequest, ParseError> {
    let captures = PEER_NAME.captures(address).ok_or_else(|| ParseError {
        address: address.to_string(),
    })?;

    Ok(PeerRequest {
        unit_name: captures[1].to_string(),
        credential_id: captures[2].to_string(),
    })
}

/// Kernel-reported identity of the connecting process (`SO_PEERCRED`).
///
/// Only used for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Not every platform reports a PID.
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

impl std::fmt::Display for PeerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid {pid}, uid {}, gid {}", self.uid, self.gid),
            None => write!(f, "uid {}, gid {}", self.uid, self.gid),
        }
    }
}
