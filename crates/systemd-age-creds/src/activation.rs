//! Systemd socket activation.
//!
//! This module claims the socket systemd passes down, as described in:
//! https://www.freedesktop.org/software/systemd/man/sd_listen_fds.html
//!
//! The activation metadata (`LISTEN_PID`, `LISTEN_FDS`, `LISTEN_FDS_START`,
//! `LISTEN_FDNAMES`) arrives as an [`ActivationContext`] built by the binary;
//! this module never reads the environment itself.
//!
//! Exactly one descriptor is supported. With `Accept=no` it is a listening
//! socket ([`claim_listener`]); with `Accept=yes` systemd has already accepted
//! the connection and passes it under the name `connection`
//! ([`claim_connection`]).

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};

use age_creds_core::{ActivationContext, ActivationError};
use socket2::{Domain, SockRef, Socket};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// A descriptor inherited from the service manager, now owned by us.
#[derive(Debug)]
pub struct ActivatedFd {
    fd: OwnedFd,
    name: String,
}

impl ActivatedFd {
    /// Name from `LISTEN_FDNAMES` (`FileDescriptorName=` in the socket unit).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

/// Validate the context and take ownership of its single descriptor.
///
/// The descriptor is marked close-on-exec so the decryption subprocess never
/// inherits it.
pub fn claim_descriptor(ctx: &ActivationContext) -> Result<ActivatedFd, ActivationError> {
    let name = ctx.validate(std::process::id())?.to_string();
    let fd = ctx.fds_start;
    if fd < 0 {
        return Err(ActivationError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid LISTEN_FDS_START={fd}"),
        )));
    }

    // Safety: the borrow ends before ownership is taken below, and fcntl
    // reports EBADF instead of misbehaving if the descriptor is not open.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    SockRef::from(&borrowed).set_cloexec(true)?;

    // Safety: the context was validated for this process, so the service
    // manager handed `fd` to us and nothing else in the process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    debug!(fd = fd.as_raw_fd(), name = %name, "Claimed activated descriptor");
    Ok(ActivatedFd { fd, name })
}

/// Claim the activated descriptor as a listening unix socket.
pub fn claim_listener(ctx: &ActivationContext) -> Result<UnixListener, ActivationError> {
    let activated = claim_descriptor(ctx)?;
    let socket = unix_socket(activated)?;

    if !socket.is_listener()? {
        return Err(ActivationError::NotListening(socket.as_raw_fd()));
    }

    let std_listener = StdUnixListener::from(OwnedFd::from(socket));
    // Set non-blocking mode for tokio
    std_listener.set_nonblocking(true)?;

    Ok(UnixListener::from_std(std_listener)?)
}

/// Claim the activated descriptor as an already-accepted unix connection.
pub fn claim_connection(ctx: &ActivationContext) -> Result<UnixStream, ActivationError> {
    let activated = claim_descriptor(ctx)?;
    let socket = unix_socket(activated)?;

    let std_stream = StdUnixStream::from(OwnedFd::from(socket));
    std_stream.set_nonblocking(true)?;

    Ok(UnixStream::from_std(std_stream)?)
}

/// Check the descriptor is an `AF_UNIX` socket.
fn unix_socket(activated: ActivatedFd) -> Result<Socket, ActivationError> {
    let socket = Socket::from(activated.into_owned_fd());
    let local = match socket.local_addr() {
        Ok(local) => local,
        Err(e) if e.raw_os_error() == Some(libc::ENOTSOCK) => {
            return Err(ActivationError::NotSocket(socket.as_raw_fd()));
        }
        Err(e) => return Err(e.into()),
    };

    if local.domain() != Domain::UNIX {
        return Err(ActivationError::NotLocalSocket {
            fd: socket.as_raw_fd(),
            family: i32::from(local.family()),
        });
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    /// Far above any descriptor a test process has open.
    const UNOPENED_FD: RawFd = 999_999;

    fn listener_fd(dir: &tempfile::TempDir) -> RawFd {
        let listener = StdUnixListener::bind(dir.path().join("foo.sock")).unwrap();
        listener.into_raw_fd()
    }

    #[tokio::test]
    async fn claims_the_preopened_listener() {
        let dir = tempfile::tempdir().unwrap();
        let fd = listener_fd(&dir);

        let ctx = ActivationContext::for_current_process(fd, "foo.sock");
        let listener = claim_listener(&ctx).unwrap();

        assert_eq!(listener.as_raw_fd(), fd);
        assert_eq!(
            listener.local_addr().unwrap().as_pathname(),
            Some(dir.path().join("foo.sock").as_path())
        );
    }

    #[tokio::test]
    async fn claimed_listener_accepts_connections() {
        let dir = tempfile::tempdir().unwrap();
        let fd = listener_fd(&dir);

        let listener =
            claim_listener(&ActivationContext::for_current_process(fd, "foo.sock")).unwrap();
        let _client = UnixStream::connect(dir.path().join("foo.sock")).await.unwrap();
        listener.accept().await.unwrap();
    }

    #[test]
    fn claimed_descriptor_keeps_name_and_fd() {
        let dir = tempfile::tempdir().unwrap();
        let fd = listener_fd(&dir);

        let activated =
            claim_descriptor(&ActivationContext::for_current_process(fd, "foo.sock")).unwrap();
        assert_eq!(activated.name(), "foo.sock");
        assert_eq!(activated.as_raw_fd(), fd);
    }

    #[test]
    fn wrong_pid_is_rejected_before_touching_the_fd() {
        let ctx = ActivationContext {
            pid: std::process::id().wrapping_add(1),
            ..ActivationContext::for_current_process(UNOPENED_FD, "foo.sock")
        };
        assert!(matches!(
            claim_descriptor(&ctx).unwrap_err(),
            ActivationError::PidMismatch { .. }
        ));
    }

    #[test]
    fn multiple_fds_are_rejected() {
        let ctx = ActivationContext {
            fds: 2,
            ..ActivationContext::for_current_process(UNOPENED_FD, "a:b")
        };
        assert!(matches!(
            claim_descriptor(&ctx).unwrap_err(),
            ActivationError::FdCount(2)
        ));
    }

    #[test]
    fn multiple_names_are_rejected() {
        let ctx = ActivationContext::for_current_process(UNOPENED_FD, "foo.sock:bar.sock");
        assert!(matches!(
            claim_descriptor(&ctx).unwrap_err(),
            ActivationError::FdNames(_)
        ));
    }

    #[test]
    fn unopened_descriptor_is_an_io_error() {
        for fd in [-1, UNOPENED_FD] {
            let ctx = ActivationContext::for_current_process(fd, "foo.sock");
            assert!(matches!(
                claim_descriptor(&ctx).unwrap_err(),
                ActivationError::Io(_)
            ));
        }
    }

    #[tokio::test]
    async fn tcp_socket_is_not_a_local_socket() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = tcp.into_raw_fd();

        let err = claim_listener(&ActivationContext::for_current_process(fd, "tcp")).unwrap_err();
        assert!(matches!(err, ActivationError::NotLocalSocket { .. }));
    }

    #[tokio::test]
    async fn tcp_connection_is_not_a_local_socket() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(tcp.local_addr().unwrap()).unwrap();
        let fd = client.into_raw_fd();

        let err =
            claim_connection(&ActivationContext::for_current_process(fd, "connection")).unwrap_err();
        assert!(matches!(
            err,
            ActivationError::NotLocalSocket { family, .. } if family == libc::AF_INET
        ));
    }

    #[tokio::test]
    async fn regular_file_is_not_a_socket() {
        let claims: [fn(&ActivationContext) -> Result<(), ActivationError>; 2] = [
            |ctx| claim_listener(ctx).map(drop),
            |ctx| claim_connection(ctx).map(drop),
        ];
        for claim in claims {
            let file = std::fs::File::open("/dev/null").unwrap();
            let fd = file.into_raw_fd();

            let err = claim(&ActivationContext::for_current_process(fd, "null")).unwrap_err();
            assert!(
                matches!(err, ActivationError::NotSocket(n) if n == fd),
                "{err:?}"
            );
        }
    }

    #[tokio::test]
    async fn connected_socket_is_not_a_listener() {
        let (a, _b) = StdUnixStream::pair().unwrap();
        let fd = a.into_raw_fd();

        let err = claim_listener(&ActivationContext::for_current_process(fd, "pair")).unwrap_err();
        assert!(matches!(err, ActivationError::NotListening(_)));
    }

    #[tokio::test]
    async fn claims_an_accepted_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = StdUnixStream::pair().unwrap();
        let fd = a.into_raw_fd();

        let mut conn =
            claim_connection(&ActivationContext::for_current_process(fd, "connection")).unwrap();
        assert_eq!(conn.as_raw_fd(), fd);

        conn.write_all(b"ping").await.unwrap();
        drop(conn);

        let mut peer = UnixStream::from_std({
            b.set_nonblocking(true).unwrap();
            b
        })
        .unwrap();
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }
}
