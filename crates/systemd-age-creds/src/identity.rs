//! Who is on the other end of a connection.

use std::io;

use age_creds_core::PeerCredentials;
use socket2::{SockAddr, SockRef};
use tokio::net::UnixStream;

/// Render the peer's bound address the way systemd documents it: abstract
/// names as `@name`, filesystem sockets as their path, unbound peers as "".
pub fn peer_address(stream: &UnixStream) -> io::Result<String> {
    let addr = SockRef::from(stream).peer_addr()?;
    Ok(render_unix_address(&addr))
}

fn render_unix_address(addr: &SockAddr) -> String {
    if let Some(name) = addr.as_abstract_namespace() {
        format!("@{}", String::from_utf8_lossy(name))
    } else if let Some(path) = addr.as_pathname() {
        path.display().to_string()
    } else {
        String::new()
    }
}

/// Read `SO_PEERCRED` for the connection.
pub fn read_peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let cred = stream.peer_cred()?;
    Ok(PeerCredentials {
        pid: cred.pid(),
        uid: cred.uid(),
        gid: cred.gid(),
    })
}
