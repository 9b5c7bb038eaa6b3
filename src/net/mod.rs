//! TCP socket primitives.

mod socket;

pub use self::socket::Socket;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolve `host:port` to a socket address, blocking on the system
/// resolver. This is a utility for setup code, not something to call from
/// an event loop callback.
pub fn resolve(host_port: &str) -> io::Result<SocketAddr> {
    host_port.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}", host_port),
        )
    })
}
