use std::io;
use std::mem::{self, size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// A `sockaddr_in` or `sockaddr_in6` by value, plus the length the kernel
/// expects for it. Keeps the unsafe pointer juggling in one place.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// # Safety
///
/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the
/// kernel.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Create a new non-blocking, close-on-exec stream socket for `addr`'s
/// family.
pub(crate) fn new_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    ))
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_length) = socket_addr(addr);
    syscall!(bind(fd, raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
}

pub(crate) fn listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, libc::SOMAXCONN)).map(|_| ())
}

/// Issue a non-blocking connect. The raw errno is what the caller's state
/// machine dispatches on, so the error is returned untranslated.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_length) = socket_addr(addr);
    syscall!(connect(fd, raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
}

/// Accept one pending connection; the new descriptor is non-blocking and
/// close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let peer = syscall!(accept4(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut length,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    let addr = unsafe { to_socket_addr(storage.as_ptr())? };
    Ok((peer, addr))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut length
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut length
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

/// Fetch and clear the pending socket error (`SO_ERROR`).
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut optval: libc::c_int = 0;
    let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut optval as *mut _ as *mut libc::c_void,
        &mut optlen,
    ))?;
    if optval == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(optval)))
    }
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

fn set_opt(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    on: bool,
) -> io::Result<()> {
    let optval: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &optval as *const _ as *const libc::c_void,
        mem::size_of_val(&optval) as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}
