use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::LoopCore;
use crate::net::Socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

/// Owns the listening socket and accepts incoming connections, one per
/// readiness event; the level-triggered poller re-reports the backlog, so
/// bursts are not lost.
pub(crate) struct Acceptor {
    socket: Socket,
    channel: Rc<Channel>,
    // Escape hatch for EMFILE: a descriptor held in reserve so the
    // pending connection can be accepted and closed instead of spinning
    // the accept loop.
    idle_fd: RefCell<Option<OwnedFd>>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
}

impl Acceptor {
    pub(crate) fn new(
        core: &Rc<LoopCore>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Rc<Acceptor>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        let channel = Channel::new(core, socket.as_raw_fd());
        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            idle_fd: RefCell::new(Some(open_idle_fd()?)),
            new_connection_callback: RefCell::new(None),
            listening: Cell::new(false),
        });

        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.get()
    }

    pub(crate) fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        self.listening.set(true);
        self.socket.listen()?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                trace!("accepted connection from {}", peer_addr);
                let mut cb = self.new_connection_callback.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(socket, peer_addr),
                    None => drop(socket),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("Acceptor::handle_read: {}", e);
                // "The special problem of accept()ing when you can't" (see
                // libev's documentation): on EMFILE the pending connection
                // would keep the listening fd readable forever. Free the
                // reserve descriptor, accept-and-close, re-arm the reserve.
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.idle_fd.borrow_mut().take();
                    if let Ok(fd) = syscall!(accept(
                        self.socket.as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut()
                    )) {
                        // Closed immediately: the peer sees an accepted,
                        // then dropped, connection.
                        drop(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                    match open_idle_fd() {
                        Ok(fd) => *self.idle_fd.borrow_mut() = Some(fd),
                        Err(e) => error!("reopening idle fd: {}", e),
                    }
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    // SAFETY: `open(2)` returned a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
