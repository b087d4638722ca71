//! Trait definitions for pluggable components, and the errors they report.
//!
//! The daemon only depends on [`Decryptor`] to turn a credential name into
//! plaintext. Production uses the `age` CLI; tests plug in in-process
//! implementations so connection handling can be exercised without it.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitStatus;
use std::time::Instant;

use zeroize::Zeroizing;

/// Error type for claiming the socket-activated descriptor.
///
/// Every variant is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// `LISTEN_PID` names another process.
    #[error("expected LISTEN_PID={current}, but was {listen_pid}")]
    PidMismatch { listen_pid: u32, current: u32 },

    /// Exactly one descriptor is supported.
    #[error("expected LISTEN_FDS=1, but was {0}")]
    FdCount(usize),

    /// `LISTEN_FDNAMES` must hold exactly one non-empty name.
    #[error("expected LISTEN_FDNAMES to set 1 name, but was {0:?}")]
    FdNames(String),

    /// The descriptor is not a socket at all.
    #[error("activated descriptor {0} is not a socket")]
    NotSocket(i32),

    /// The descriptor is a socket, but not an `AF_UNIX` one.
    #[error("activated descriptor {fd} must be a unix socket, but has address family {family}")]
    NotLocalSocket { fd: i32, family: i32 },

    /// Listen mode was given a descriptor that is not listening.
    #[error("activated descriptor {0} is not a listening socket")]
    NotListening(i32),

    /// The descriptor could not be inspected or converted.
    #[error("failed to claim activated descriptor: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for decrypting a credential.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    /// The decryption tool could not be started or waited on.
    #[error("failed to run decryption tool for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The decryption tool exited unsuccessfully.
    #[error("age failed to decrypt {path} ({status}): {diagnostic}")]
    Failed {
        path: PathBuf,
        status: ExitStatus,
        diagnostic: String,
    },

    /// The deadline passed before the tool finished; it has been killed.
    #[error("timed out decrypting {path}")]
    Timeout { path: PathBuf },
}

impl DecryptError {
    /// Path of the credential file the failure relates to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            DecryptError::Spawn { path, .. }
            | DecryptError::Failed { path, .. }
            | DecryptError::Timeout { path } => path,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DecryptError::Timeout { .. })
    }
}

/// Trait for credential decryption backends.
///
/// Implementations must not cache: the store is the source of truth and may
/// change between requests. Plaintext is returned in a buffer that is wiped
/// on drop.
///
/// # Example (Static Implementation)
///
/// ```ignore
/// struct StaticDecryptor(Vec<u8>);
///
/// impl Decryptor for StaticDecryptor {
///     fn decrypt<'a>(&'a self, _id: &'a str, _deadline: Option<Instant>) -> ... {
///         Box::pin(async move { Ok(Zeroizing::new(self.0.clone())) })
///     }
/// }
/// ```
pub trait Decryptor: Send + Sync {
    /// Decrypt the credential named `credential_id`.
    ///
    /// When `deadline` is set and passes first, the attempt is abandoned
    /// with [`DecryptError::Timeout`].
    fn decrypt<'a>(
        &'a self,
        credential_id: &'a str,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<Zeroizing<Vec<u8>>, DecryptError>> + Send + 'a>>;
}
