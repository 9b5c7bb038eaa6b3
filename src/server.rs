use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::acceptor::Acceptor;
use crate::connection::{
    default_connection_callback, default_message_callback, destroy, establish, DriverCallbacks,
};
use crate::event_loop::{next_local_id, EventLoop, LoopCore, LoopHandle};
use crate::net::Socket;
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

struct ServerCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    high_water_mark_bytes: usize,
}

// Base-loop-confined server state: the acceptor, the worker pool and the
// name-to-connection map. Registered in the base loop's local table so the
// thread-safe removeConnection path can find it from a posted task.
struct ServerDriver {
    id: u64,
    name: String,
    ip_port: String,
    base: LoopHandle,
    acceptor: Rc<Acceptor>,
    pool: RefCell<EventLoopThreadPool>,
    connections: RefCell<HashMap<String, TcpConnection>>,
    next_conn_id: Cell<u64>,
    callbacks: RefCell<ServerCallbacks>,
}

impl ServerDriver {
    // Runs on the base loop when the acceptor hands over a connected
    // socket: pick a worker, name the connection, record it, and bring it
    // up over there.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        let io_loop = self.pool.borrow().get_next_loop();
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            "TcpServer [{}] new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("TcpServer [{}] getsockname: {}", self.name, e);
                peer_addr // degraded, but the connection still works
            }
        };
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), local_addr, peer_addr);
        self.connections
            .borrow_mut()
            .insert(conn_name, conn.clone());

        let callbacks = self.callbacks.borrow();
        let driver_callbacks = DriverCallbacks {
            connection: Some(callbacks.connection.clone()),
            message: Some(callbacks.message.clone()),
            write_complete: callbacks.write_complete.clone(),
            high_water_mark: callbacks.high_water_mark.clone(),
            close: Some(remove_connection_callback(self.base.clone(), self.id)),
        };
        let high_water_mark_bytes = callbacks.high_water_mark_bytes;
        drop(callbacks);

        io_loop.run_in_loop(move || establish(conn, socket, driver_callbacks, high_water_mark_bytes));
    }

    // Base loop: drop the map's reference, then let the worker destroy the
    // connection on its own thread. The two-step hop keeps the map
    // single-threaded.
    fn remove_connection_in_loop(&self, conn: &TcpConnection) {
        info!(
            "TcpServer [{}] removing connection [{}]",
            self.name,
            conn.name()
        );
        let removed = self.connections.borrow_mut().remove(conn.name());
        debug_assert!(removed.is_some());
        let conn_id = conn.id();
        conn.owner_loop().queue_in_loop(move || destroy(conn_id));
    }
}

// The close callback every server connection gets: thread-safe, forwards
// onto the base loop. If the server is already gone the connection is
// destroyed directly so its driver cannot leak.
fn remove_connection_callback(
    base: LoopHandle,
    server_id: u64,
) -> Arc<dyn Fn(&TcpConnection) + Send + Sync> {
    Arc::new(move |conn: &TcpConnection| {
        let conn = conn.clone();
        base.run_in_loop(move || {
            let driver = LoopCore::try_current()
                .and_then(|core| core.get_local(server_id))
                .and_then(|local| local.downcast::<ServerDriver>().ok());
            match driver {
                Some(driver) => driver.remove_connection_in_loop(&conn),
                None => {
                    let conn_id = conn.id();
                    conn.owner_loop().queue_in_loop(move || destroy(conn_id));
                }
            }
        });
    })
}

/// TCP server: an acceptor on the base loop, a pool of worker loops, and
/// the set of live connections.
///
/// Construct and start it on the base loop's thread; the per-connection
/// callbacks installed before [`start`](TcpServer::start) run on whichever
/// worker loop each connection lands on.
pub struct TcpServer {
    driver: Rc<ServerDriver>,
    started: AtomicBool,
    thread_num: Cell<usize>,
    thread_init: RefCell<Option<ThreadInitCallback>>,
}

impl TcpServer {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        name: &str,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let core = event_loop.core();
        let acceptor = Acceptor::new(core, listen_addr, option == ServerOption::ReusePort)?;
        let ip_port = acceptor.listen_addr()?.to_string();

        let driver = Rc::new(ServerDriver {
            id: next_local_id(),
            name: name.to_string(),
            ip_port,
            base: event_loop.handle(),
            acceptor,
            pool: RefCell::new(EventLoopThreadPool::new(event_loop.handle(), name)),
            connections: RefCell::new(HashMap::new()),
            next_conn_id: Cell::new(1),
            callbacks: RefCell::new(ServerCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                high_water_mark: None,
                high_water_mark_bytes: DEFAULT_HIGH_WATER_MARK,
            }),
        });
        core.insert_local(driver.id, driver.clone());

        let weak = Rc::downgrade(&driver);
        driver
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(driver) = weak.upgrade() {
                    driver.new_connection(socket, peer_addr);
                }
            }));
        Ok(TcpServer {
            driver,
            started: AtomicBool::new(false),
            thread_num: Cell::new(0),
            thread_init: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.driver.name
    }

    /// The bound address, as `ip:port`; useful with an ephemeral port.
    pub fn ip_port(&self) -> &str {
        &self.driver.ip_port
    }

    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.driver.acceptor.listen_addr()
    }

    /// Worker loop count; 0 keeps all I/O on the base loop.
    pub fn set_thread_num(&self, thread_num: usize) {
        self.thread_num.set(thread_num);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init.borrow_mut() = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.driver.callbacks.borrow_mut().connection = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.driver.callbacks.borrow_mut().message = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.driver.callbacks.borrow_mut().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        let mut callbacks = self.driver.callbacks.borrow_mut();
        callbacks.high_water_mark = Some(cb);
        callbacks.high_water_mark_bytes = mark;
    }

    /// Spawn the workers and start listening. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut pool = self.driver.pool.borrow_mut();
        pool.set_thread_num(self.thread_num.get());
        pool.start(self.thread_init.borrow().clone());
        drop(pool);

        assert!(!self.driver.acceptor.listening());
        self.driver.acceptor.listen()?;
        info!(
            "TcpServer [{}] listening on {}",
            self.driver.name, self.driver.ip_port
        );
        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Destroy surviving connections on their own loops, then drop the
        // driver (which joins the worker threads via the pool). For
        // base-loop connections this runs inline: the base loop may have
        // already left `run`, so a queued task would never drain.
        for (_, conn) in self.driver.connections.borrow_mut().drain() {
            let conn_id = conn.id();
            conn.owner_loop().run_in_loop(move || destroy(conn_id));
        }
        if let Some(core) = LoopCore::try_current() {
            core.take_local(self.driver.id);
        }
    }
}
