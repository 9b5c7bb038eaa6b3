use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::event_loop::{next_local_id, LoopCore, LoopHandle};
use crate::net::Socket;
use crate::{Buffer, Timestamp};

/// Default output-buffer threshold for the high-water-mark callback.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Called on both the up and the down transition of a connection.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
/// Called whenever new bytes arrive; may consume any prefix of the buffer.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer, Timestamp) + Send + Sync>;
/// Called after the output buffer empties due to a write.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
/// Called once each time the output buffer grows across the threshold from
/// below.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnection, usize) + Send + Sync>;
/// Internal: fired after the down-transition `ConnectionCallback`, used by
/// server and client to drop the connection from their maps.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

struct Inner {
    id: u64,
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    owner_loop: LoopHandle,
    state: AtomicU8,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

/// Handle to one TCP connection, for both server and client usage.
///
/// The handle is cheap to clone and safe to use from any thread; every
/// mutating operation forwards onto the connection's own loop. The
/// buffers, the channel and the callbacks live in a loop-confined driver
/// that dies with the connection, so an operation posted after teardown
/// simply finds nothing and is dropped.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<Inner>,
}

impl TcpConnection {
    pub(crate) fn new(
        owner_loop: LoopHandle,
        name: String,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnection {
        TcpConnection {
            inner: Arc::new(Inner {
                id: next_local_id(),
                name,
                local_addr,
                peer_addr,
                owner_loop,
                state: AtomicU8::new(State::Connecting as u8),
                context: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.inner.owner_loop
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Send bytes, non-blocking. Safe from any thread; sends issued from
    /// one thread keep their order on the wire. Off the loop thread the
    /// payload is copied.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            warn!("{} disconnected, give up writing", self.name());
            return;
        }
        if self.inner.owner_loop.is_in_loop_thread() {
            if let Some(driver) = self.driver() {
                driver.send_in_loop(data);
            }
        } else {
            let owned = data.to_vec();
            let conn = self.clone();
            self.inner.owner_loop.run_in_loop(move || {
                if let Some(driver) = conn.driver() {
                    driver.send_in_loop(&owned);
                }
            });
        }
    }

    /// Send and drain a whole buffer; same pipeline and ordering as
    /// [`send`](TcpConnection::send).
    pub fn send_buffer(&self, buffer: &mut Buffer) {
        if self.state() != State::Connected {
            warn!("{} disconnected, give up writing", self.name());
            return;
        }
        if self.inner.owner_loop.is_in_loop_thread() {
            if let Some(driver) = self.driver() {
                driver.send_in_loop(buffer.peek());
            }
            buffer.retrieve_all();
        } else {
            let owned = buffer.take_all();
            let conn = self.clone();
            self.inner.owner_loop.run_in_loop(move || {
                if let Some(driver) = conn.driver() {
                    driver.send_in_loop(&owned);
                }
            });
        }
    }

    /// Close the writing half once the output buffer drains. The first
    /// effective call wins; later calls are no-ops.
    pub fn shutdown(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let conn = self.clone();
            self.inner.owner_loop.run_in_loop(move || {
                if let Some(driver) = conn.driver() {
                    driver.shutdown_in_loop();
                }
            });
        }
    }

    /// Tear the connection down without waiting for the output buffer.
    pub fn force_close(&self) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.inner.owner_loop.queue_in_loop(move || {
                if let Some(driver) = conn.driver() {
                    driver.force_close_in_loop();
                }
            });
        }
    }

    /// Like [`force_close`](TcpConnection::force_close), after a delay. The
    /// timer holds only a weak reference, so a connection collected in the
    /// meantime is not resurrected.
    pub fn force_close_with_delay(&self, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = Arc::downgrade(&self.inner);
            self.inner.owner_loop.run_after(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection { inner }.force_close();
                }
            });
        }
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        let conn = self.clone();
        self.inner.owner_loop.run_in_loop(move || {
            if let Some(driver) = conn.driver() {
                if let Err(e) = driver.socket.set_tcp_nodelay(on) {
                    error!("{} set_tcp_nodelay: {}", conn.name(), e);
                }
            }
        });
    }

    pub fn start_read(&self) {
        let conn = self.clone();
        self.inner.owner_loop.run_in_loop(move || {
            if let Some(driver) = conn.driver() {
                driver.start_read_in_loop();
            }
        });
    }

    pub fn stop_read(&self) {
        let conn = self.clone();
        self.inner.owner_loop.run_in_loop(move || {
            if let Some(driver) = conn.driver() {
                driver.stop_read_in_loop();
            }
        });
    }

    /// Whether the read side is currently enabled. Loop-thread query; from
    /// elsewhere it reports the last published state at best.
    pub fn is_reading(&self) -> bool {
        if self.inner.owner_loop.is_in_loop_thread() {
            self.driver().map_or(false, |driver| driver.reading.get())
        } else {
            false
        }
    }

    /// Adjust the output-buffer threshold of the high-water-mark callback.
    pub fn set_high_water_mark(&self, mark: usize) {
        let conn = self.clone();
        self.inner.owner_loop.run_in_loop(move || {
            if let Some(driver) = conn.driver() {
                driver.high_water_mark.set(mark);
            }
        });
    }

    /// Store an arbitrary per-connection value, e.g. protocol parser state.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.inner.context.lock().unwrap_or_else(|e| e.into_inner()) = Some(context);
    }

    pub fn clear_context(&self) {
        *self.inner.context.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Borrow the context as `T`. Returns `None` when no context is set or
    /// the type does not match.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.inner.context.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    fn driver(&self) -> Option<Rc<ConnectionDriver>> {
        LoopCore::try_current()?
            .get_local(self.inner.id)?
            .downcast::<ConnectionDriver>()
            .ok()
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.inner.name)
            .field("local", &self.inner.local_addr)
            .field("peer", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Clone, Default)]
pub(crate) struct DriverCallbacks {
    pub(crate) connection: Option<ConnectionCallback>,
    pub(crate) message: Option<MessageCallback>,
    pub(crate) write_complete: Option<WriteCompleteCallback>,
    pub(crate) high_water_mark: Option<HighWaterMarkCallback>,
    pub(crate) close: Option<CloseCallback>,
}

/// The loop-confined half of a connection: socket, channel, buffers and
/// callbacks. Lives in the owning loop's local table from
/// `connect_established` until `connect_destroyed`.
pub(crate) struct ConnectionDriver {
    conn: TcpConnection,
    socket: Socket,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    reading: Cell<bool>,
    high_water_mark: Cell<usize>,
    callbacks: DriverCallbacks,
}

/// Build the driver for a freshly connected socket and bring the
/// connection up. Must run on the connection's own loop.
pub(crate) fn establish(
    conn: TcpConnection,
    socket: Socket,
    callbacks: DriverCallbacks,
    high_water_mark: usize,
) {
    let core = LoopCore::current();
    debug_assert!(conn.inner.owner_loop.is_in_loop_thread());
    debug!(
        "TcpConnection [{}] establishing, fd = {}",
        conn.name(),
        socket.as_raw_fd()
    );
    if let Err(e) = socket.set_keep_alive(true) {
        error!("{} set_keep_alive: {}", conn.name(), e);
    }

    let channel = Channel::new(&core, socket.as_raw_fd());
    let driver = Rc::new(ConnectionDriver {
        conn: conn.clone(),
        socket,
        channel: channel.clone(),
        input: RefCell::new(Buffer::new()),
        output: RefCell::new(Buffer::new()),
        reading: Cell::new(false),
        high_water_mark: Cell::new(high_water_mark),
        callbacks,
    });

    let weak = Rc::downgrade(&driver);
    channel.set_read_callback(Box::new(move |receive_time| {
        if let Some(driver) = weak.upgrade() {
            driver.handle_read(receive_time);
        }
    }));
    let weak = Rc::downgrade(&driver);
    channel.set_write_callback(Box::new(move || {
        if let Some(driver) = weak.upgrade() {
            driver.handle_write();
        }
    }));
    let weak = Rc::downgrade(&driver);
    channel.set_close_callback(Box::new(move || {
        if let Some(driver) = weak.upgrade() {
            driver.handle_close();
        }
    }));
    let weak = Rc::downgrade(&driver);
    channel.set_error_callback(Box::new(move || {
        if let Some(driver) = weak.upgrade() {
            driver.handle_error();
        }
    }));

    core.insert_local(conn.id(), driver.clone());
    ConnectionDriver::connect_established(&driver);
}

/// Final teardown, posted by the server or client after the connection
/// left their map. Idempotent: the local-table entry can only be taken
/// once.
pub(crate) fn destroy(conn_id: u64) {
    if let Some(core) = LoopCore::try_current() {
        if let Some(local) = core.take_local(conn_id) {
            if let Ok(driver) = local.downcast::<ConnectionDriver>() {
                driver.connect_destroyed();
            }
        }
    }
}

impl ConnectionDriver {
    fn connect_established(driver: &Rc<ConnectionDriver>) {
        assert_eq!(driver.conn.state(), State::Connecting);
        driver.conn.set_state(State::Connected);
        driver.reading.set(true);
        let tie: Rc<dyn Any> = driver.clone();
        driver.channel.tie(&tie);
        driver.channel.enable_reading();

        if let Some(cb) = &driver.callbacks.connection {
            cb(&driver.conn);
        }
    }

    fn connect_destroyed(&self) {
        if self.conn.state() == State::Connected {
            self.conn.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = &self.callbacks.connection {
                cb(&self.conn);
            }
        }
        self.channel.remove();
        debug!("TcpConnection [{}] destroyed", self.conn.name());
    }

    fn handle_read(&self, receive_time: Timestamp) {
        let result = self.input.borrow_mut().read_from_fd(self.socket.as_raw_fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!("{} received {} bytes", self.conn.name(), n);
                match &self.callbacks.message {
                    Some(cb) => {
                        let cb = cb.clone();
                        let mut input = self.input.borrow_mut();
                        cb(&self.conn, &mut input, receive_time);
                    }
                    None => self.input.borrow_mut().retrieve_all(),
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                // Transient; the level-triggered poller re-reports real
                // readiness.
            }
            Err(e) => {
                error!("{} handle_read: {}", self.conn.name(), e);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writing() {
            trace!(
                "connection fd = {} is down, no more writing",
                self.channel.fd()
            );
            return;
        }
        let drained = {
            let mut output = self.output.borrow_mut();
            match self.socket.write(output.peek()) {
                Ok(n) => {
                    trace!("{} wrote {} bytes from buffer", self.conn.name(), n);
                    output.retrieve(n);
                    output.readable_bytes() == 0
                }
                Err(e) => {
                    error!("{} handle_write: {}", self.conn.name(), e);
                    false
                }
            }
        };
        if drained {
            self.channel.disable_writing();
            self.queue_write_complete();
            if self.conn.state() == State::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    /// Down-transition. Fires the connection callback with the connection
    /// already in `Disconnected` state, then the close callback; the owner
    /// uses the latter to drop its reference.
    fn handle_close(&self) {
        trace!(
            "fd = {} state = {:?}",
            self.channel.fd(),
            self.conn.state()
        );
        assert!(matches!(
            self.conn.state(),
            State::Connected | State::Disconnecting
        ));
        self.conn.set_state(State::Disconnected);
        self.channel.disable_all();

        let guard = self.conn.clone();
        if let Some(cb) = &self.callbacks.connection {
            cb(&guard);
        }
        // Must be the last thing this connection does.
        if let Some(cb) = &self.callbacks.close {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("TcpConnection [{}] SO_ERROR = {}", self.conn.name(), e),
            Ok(None) => {}
            Err(e) => error!("TcpConnection [{}] take_error: {}", self.conn.name(), e),
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.conn.state() == State::Disconnected {
            warn!("{} disconnected, give up writing", self.conn.name());
            return;
        }
        let mut nwrote = 0;
        let mut fault = false;

        // Nothing queued: try the socket directly and only buffer the
        // remainder.
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    trace!("{} wrote {} bytes directly", self.conn.name(), n);
                    nwrote = n;
                    if nwrote == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("{} send_in_loop: {}", self.conn.name(), e);
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault && remaining > 0 {
            let mut output = self.output.borrow_mut();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.get();
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = &self.callbacks.high_water_mark {
                    let cb = cb.clone();
                    let conn = self.conn.clone();
                    let new_len = old_len + remaining;
                    self.conn
                        .owner_loop()
                        .queue_in_loop(move || cb(&conn, new_len));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn queue_write_complete(&self) {
        if let Some(cb) = &self.callbacks.write_complete {
            let cb = cb.clone();
            let conn = self.conn.clone();
            self.conn.owner_loop().queue_in_loop(move || cb(&conn));
        }
    }

    fn shutdown_in_loop(&self) {
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!("{} shutdown_write: {}", self.conn.name(), e);
            }
        }
    }

    fn force_close_in_loop(&self) {
        if matches!(
            self.conn.state(),
            State::Connected | State::Disconnecting
        ) {
            // As if the peer closed: same down path.
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        if !self.reading.get() || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.set(true);
        }
    }

    fn stop_read_in_loop(&self) {
        if self.reading.get() || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.set(false);
        }
    }
}

pub(crate) fn default_connection_callback(conn: &TcpConnection) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
    // Do not close here; some users only care about messages.
}

pub(crate) fn default_message_callback(
    _conn: &TcpConnection,
    buffer: &mut Buffer,
    _receive_time: Timestamp,
) {
    buffer.retrieve_all();
}
