use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::Channel;
use crate::event_loop::LoopCore;
use crate::net::Socket;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket)>;

/// Client-side non-blocking connect with exponential backoff.
///
/// One attempt at a time: a fresh socket gets a fresh channel watching for
/// writability; once writable, `SO_ERROR` decides between success, retry
/// and abandonment. Self-connects (the connect landing on its own local
/// endpoint) are detected and retried. Loop-confined; `TcpClient` drives
/// it through posted tasks.
pub(crate) struct Connector {
    self_ref: Weak<Connector>,
    server_addr: SocketAddr,
    started: Cell<bool>,
    state: Cell<State>,
    socket: RefCell<Option<Socket>>,
    channel: RefCell<Option<Rc<Channel>>>,
    retry_delay: Cell<Duration>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
}

impl Connector {
    pub(crate) fn new(server_addr: SocketAddr) -> Rc<Connector> {
        Rc::new_cyclic(|self_ref| Connector {
            self_ref: self_ref.clone(),
            server_addr,
            started: Cell::new(false),
            state: Cell::new(State::Disconnected),
            socket: RefCell::new(None),
            channel: RefCell::new(None),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            new_connection_callback: RefCell::new(None),
        })
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub(crate) fn start_in_loop(&self) {
        self.started.set(true);
        if self.state.get() == State::Disconnected {
            self.connect();
        } else {
            debug!("connector to {} already active", self.server_addr);
        }
    }

    pub(crate) fn stop_in_loop(&self) {
        self.started.set(false);
        if self.state.get() == State::Connecting {
            self.state.set(State::Disconnected);
            // Dropping the socket aborts the attempt.
            let _socket = self.remove_and_reset_channel();
        }
    }

    /// Begin a fresh connect cycle after the previous connection went
    /// down. Resets the backoff.
    pub(crate) fn restart_in_loop(&self) {
        self.state.set(State::Disconnected);
        self.retry_delay.set(INIT_RETRY_DELAY);
        self.start_in_loop();
    }

    fn connect(&self) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("connector socket creation: {}", e);
                return;
            }
        };
        let errno = match socket.connect(&self.server_addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(0),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            _ => {
                error!(
                    "connect to {} failed with errno {}",
                    self.server_addr, errno
                );
            }
        }
    }

    fn connecting(&self, socket: Socket) {
        self.state.set(State::Connecting);
        let channel = Channel::new(&LoopCore::current(), socket.as_raw_fd());
        *self.socket.borrow_mut() = Some(socket);

        let weak = self.self_ref.clone();
        channel.set_write_callback(Box::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        }));
        let weak = self.self_ref.clone();
        channel.set_error_callback(Box::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        }));
        channel.enable_writing();
        *self.channel.borrow_mut() = Some(channel);
    }

    fn remove_and_reset_channel(&self) -> Option<Socket> {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        self.socket.borrow_mut().take()
    }

    // Write readiness on a connecting socket means the attempt resolved,
    // one way or the other.
    fn handle_write(&self) {
        if self.state.get() != State::Connecting {
            debug_assert_eq!(self.state.get(), State::Disconnected);
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };
        match socket.take_error() {
            Ok(Some(err)) => {
                warn!("connect to {}: SO_ERROR = {}", self.server_addr, err);
                self.retry(socket);
            }
            Err(e) => {
                warn!("connect to {}: take_error: {}", self.server_addr, e);
                self.retry(socket);
            }
            Ok(None) => {
                if socket.is_self_connect() {
                    warn!("connect to {}: self connect", self.server_addr);
                    self.retry(socket);
                } else {
                    self.state.set(State::Connected);
                    if self.started.get() {
                        let mut cb = self.new_connection_callback.borrow_mut();
                        match cb.as_mut() {
                            Some(cb) => cb(socket),
                            None => drop(socket),
                        }
                    }
                    // else: stopped while the connect was in flight; the
                    // socket drops here.
                }
            }
        }
    }

    fn handle_error(&self) {
        error!("connector to {} error event", self.server_addr);
        if self.state.get() == State::Connecting {
            let Some(socket) = self.remove_and_reset_channel() else {
                return;
            };
            if let Ok(Some(err)) = socket.take_error() {
                warn!("connect to {}: SO_ERROR = {}", self.server_addr, err);
            }
            self.retry(socket);
        }
    }

    /// Drop the failed socket and schedule a fresh attempt, doubling the
    /// delay up to the cap. The timer holds a weak reference so a dropped
    /// client stops the cycle.
    fn retry(&self, socket: Socket) {
        drop(socket);
        self.state.set(State::Disconnected);
        if !self.started.get() {
            debug!("connector to {} stopped, not retrying", self.server_addr);
            return;
        }
        let delay = self.retry_delay.get();
        info!(
            "retrying connect to {} in {} ms",
            self.server_addr,
            delay.as_millis()
        );
        self.retry_delay.set((delay * 2).min(MAX_RETRY_DELAY));

        let weak = self.self_ref.clone();
        LoopCore::current().run_after_local(
            delay,
            Box::new(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            }),
        );
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        // An in-flight attempt still holds a registered channel.
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
    }
}
