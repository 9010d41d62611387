use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::warn;
use socket2::{Domain, Protocol, SockAddr, Socket as SysSocket, Type};

const LISTEN_BACKLOG: libc::c_int = 1024;

/// An owned, nonblocking TCP socket (connected or listening).
///
/// The descriptor is closed when the value is dropped; a connection that
/// leaks shows up as a socket that never reached the disconnected state.
pub struct Socket {
    inner: SysSocket,
}

impl Socket {
    /// Creates a nonblocking listening socket bound to `addr`.
    /// `SO_REUSEADDR` is always set, `SO_REUSEPORT` on request. The
    /// `listen` syscall is issued separately by the acceptor.
    pub(crate) fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<Socket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = SysSocket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&addr.into())?;
        Ok(Socket { inner: socket })
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        self.inner.listen(LISTEN_BACKLOG)
    }

    /// Nonblocking write; short writes and `WouldBlock` surface as-is.
    pub(crate) fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    /// Closes the write half, letting the peer observe EOF after it has
    /// drained everything in flight.
    pub(crate) fn shutdown_write(&self) {
        if let Err(err) = self.inner.shutdown(Shutdown::Write) {
            warn!("shutdown(SHUT_WR) fd={}: {}", self.as_raw_fd(), err);
        }
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    /// Toggles `TCP_NODELAY` (disables Nagle's algorithm).
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    /// The pending `SO_ERROR`, if any, clearing it.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// Local address of this socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.inner.local_addr()?)
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.inner.peer_addr()?)
    }
}

fn to_socket_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))
}

impl FromRawFd for Socket {
    /// Adopts an already-connected, nonblocking descriptor (from
    /// `accept4`).
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            inner: SysSocket::from_raw_fd(fd),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
