//! One request/response exchange.
//!
//! The protocol has no framing: the client sends nothing, the request is its
//! bound socket address, and the response is the raw plaintext terminated by
//! the server closing the connection. A failed request closes without data.

use std::io;
use std::time::{Duration, Instant};

use age_creds_core::{parse_peer_name, DecryptError, Decryptor, ParseError, PeerRequest};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::identity;

/// Error type for a single connection. Never fatal to the server.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to read peer address: {0}")]
    PeerAddress(#[source] io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{} requested '{}': {source}", .request.unit_name, .request.credential_id)]
    Decrypt {
        request: PeerRequest,
        #[source]
        source: DecryptError,
    },

    #[error("failed to write credential: {0}")]
    Write(#[source] io::Error),

    #[error("timed out writing credential")]
    Timeout,
}

/// Serve one connection and close it.
///
/// `timeout` bounds the whole exchange, not each step. The stream is dropped,
/// and so closed, on every path out of this function.
pub async fn handle_connection<D: Decryptor + ?Sized>(
    mut stream: UnixStream,
    decryptor: &D,
    timeout: Option<Duration>,
) -> Result<PeerRequest, ConnectionError> {
    let deadline = timeout.map(|t| Instant::now() + t);

    let address = identity::peer_address(&stream).map_err(ConnectionError::PeerAddress)?;
    let request = parse_peer_name(&address)?;

    match identity::read_peer_credentials(&stream) {
        Ok(peer) => info!(
            unit = %request.unit_name,
            credential = %request.credential_id,
            pid = ?peer.pid,
            uid = peer.uid,
            gid = peer.gid,
            "Credential requested"
        ),
        Err(e) => {
            warn!(error = %e, "Failed to get peer credentials");
            info!(
                unit = %request.unit_name,
                credential = %request.credential_id,
                "Credential requested"
            );
        }
    }

    let plaintext = match decryptor.decrypt(&request.credential_id, deadline).await {
        Ok(plaintext) => plaintext,
        Err(source) => return Err(ConnectionError::Decrypt { request, source }),
    };

    let write = async {
        stream.write_all(&plaintext).await?;
        stream.shutdown().await
    };
    let written = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.into(), write)
            .await
            .map_err(|_| ConnectionError::Timeout)?,
        None => write.await,
    };
    written.map_err(ConnectionError::Write)?;

    debug!(
        unit = %request.unit_name,
        credential = %request.credential_id,
        bytes = plaintext.len(),
        "Credential delivered"
    );
    Ok(request)
}
