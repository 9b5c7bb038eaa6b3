use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys::net;

/// Exclusive owner of one non-blocking stream socket descriptor; the
/// descriptor is closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Create a fresh non-blocking, close-on-exec socket for `addr`'s
    /// address family.
    pub fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let fd = net::new_socket(addr)?;
        // SAFETY: the descriptor was just created and is owned by no one
        // else.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn from_raw(fd: RawFd) -> Socket {
        // SAFETY: callers hand over descriptors fresh out of `accept4`.
        Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        net::bind(self.fd.as_raw_fd(), addr)
    }

    pub fn listen(&self) -> io::Result<()> {
        net::listen(self.fd.as_raw_fd())
    }

    /// Accept one pending connection. The returned socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (fd, peer) = net::accept(self.fd.as_raw_fd())?;
        Ok((Socket::from_raw(fd), peer))
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        net::connect(self.fd.as_raw_fd(), addr)
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        net::shutdown_write(self.fd.as_raw_fd())
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        net::write(self.fd.as_raw_fd(), buf)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        net::local_addr(self.fd.as_raw_fd())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        net::peer_addr(self.fd.as_raw_fd())
    }

    /// The pending `SO_ERROR`, cleared by reading it.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        net::take_error(self.fd.as_raw_fd())
    }

    /// A non-blocking connect can land on its own local endpoint when
    /// source and destination 4-tuples collide.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        net::set_reuse_addr(self.fd.as_raw_fd(), on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        net::set_reuse_port(self.fd.as_raw_fd(), on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        net::set_keep_alive(self.fd.as_raw_fd(), on)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        net::set_tcp_nodelay(self.fd.as_raw_fd(), on)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::Socket;
    use std::net::SocketAddr;
    use std::os::fd::AsRawFd;

    #[test]
    fn bind_listen_ephemeral() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new_nonblocking(&addr).unwrap();
        socket.set_reuse_addr(true).unwrap();
        socket.bind(&addr).unwrap();
        socket.listen().unwrap();

        let bound = socket.local_addr().unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
        assert!(socket.as_raw_fd() >= 0);
    }

    #[test]
    fn accept_would_block_when_idle() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new_nonblocking(&addr).unwrap();
        socket.bind(&addr).unwrap();
        socket.listen().unwrap();
        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
