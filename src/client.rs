use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::connection::{
    default_connection_callback, default_message_callback, destroy, establish, DriverCallbacks,
};
use crate::connector::Connector;
use crate::event_loop::{next_local_id, LoopCore, LoopHandle};
use crate::net::Socket;
use crate::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
    DEFAULT_HIGH_WATER_MARK,
};

struct ClientCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

// Loop-confined client state: the connector and the one live connection.
struct ClientDriver {
    id: u64,
    name: String,
    handle: LoopHandle,
    connector: Rc<Connector>,
    connection: RefCell<Option<TcpConnection>>,
    next_conn_id: Cell<u64>,
    callbacks: RefCell<ClientCallbacks>,
    connect: Arc<AtomicBool>,
    retry: Arc<AtomicBool>,
}

impl ClientDriver {
    // The connector resolved an attempt into a connected socket; wrap it
    // into a connection on this same loop.
    fn new_connection(&self, socket: Socket) {
        let peer_addr = socket.peer_addr().unwrap_or(self.connector.server_addr());
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("TcpClient [{}] getsockname: {}", self.name, e);
                peer_addr
            }
        };
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(self.handle.clone(), conn_name, local_addr, peer_addr);
        *self.connection.borrow_mut() = Some(conn.clone());

        let callbacks = self.callbacks.borrow();
        let driver_callbacks = DriverCallbacks {
            connection: Some(callbacks.connection.clone()),
            message: Some(callbacks.message.clone()),
            write_complete: callbacks.write_complete.clone(),
            high_water_mark: None,
            close: Some(remove_connection_callback(self.handle.clone(), self.id)),
        };
        drop(callbacks);

        establish(conn, socket, driver_callbacks, DEFAULT_HIGH_WATER_MARK);
    }

    fn remove_connection(&self, conn: &TcpConnection) {
        debug_assert!(self.handle.is_in_loop_thread());
        *self.connection.borrow_mut() = None;
        let conn_id = conn.id();
        self.handle.queue_in_loop(move || destroy(conn_id));

        if self.retry.load(Ordering::SeqCst) && self.connect.load(Ordering::SeqCst) {
            info!(
                "TcpClient [{}] reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart_in_loop();
        }
    }
}

// Close callback for the client's connection; falls back to a plain
// destroy when the client is already gone.
fn remove_connection_callback(
    handle: LoopHandle,
    client_id: u64,
) -> Arc<dyn Fn(&TcpConnection) + Send + Sync> {
    Arc::new(move |conn: &TcpConnection| {
        let conn = conn.clone();
        handle.run_in_loop(move || {
            let driver = LoopCore::try_current()
                .and_then(|core| core.get_local(client_id))
                .and_then(|local| local.downcast::<ClientDriver>().ok());
            match driver {
                Some(driver) => driver.remove_connection(&conn),
                None => {
                    let conn_id = conn.id();
                    conn.owner_loop().queue_in_loop(move || destroy(conn_id));
                }
            }
        });
    })
}

/// TCP client: a connector plus at most one live connection on a single
/// loop.
///
/// The handle itself is `Send`; `connect`, `disconnect` and `stop` may be
/// called from any thread. With the retry flag set, a connection that goes
/// down is re-established through the connector's backoff.
pub struct TcpClient {
    handle: LoopHandle,
    name: String,
    server_addr: SocketAddr,
    driver_id: u64,
    connect: Arc<AtomicBool>,
    retry: Arc<AtomicBool>,
}

impl TcpClient {
    /// Create a client driving its connection on the loop behind `handle`.
    /// Install callbacks before calling [`connect`](TcpClient::connect).
    pub fn new(handle: &LoopHandle, server_addr: SocketAddr, name: &str) -> TcpClient {
        let driver_id = next_local_id();
        let connect = Arc::new(AtomicBool::new(false));
        let retry = Arc::new(AtomicBool::new(false));

        let name_owned = name.to_string();
        let handle_clone = handle.clone();
        let connect_clone = connect.clone();
        let retry_clone = retry.clone();
        handle.run_in_loop(move || {
            let connector = Connector::new(server_addr);
            let driver = Rc::new(ClientDriver {
                id: driver_id,
                name: name_owned,
                handle: handle_clone,
                connector: connector.clone(),
                connection: RefCell::new(None),
                next_conn_id: Cell::new(1),
                callbacks: RefCell::new(ClientCallbacks {
                    connection: Arc::new(default_connection_callback),
                    message: Arc::new(default_message_callback),
                    write_complete: None,
                }),
                connect: connect_clone,
                retry: retry_clone,
            });
            let weak = Rc::downgrade(&driver);
            connector.set_new_connection_callback(Box::new(move |socket| {
                if let Some(driver) = weak.upgrade() {
                    driver.new_connection(socket);
                }
            }));
            LoopCore::current().insert_local(driver_id, driver);
        });

        TcpClient {
            handle: handle.clone(),
            name: name.to_string(),
            server_addr,
            driver_id,
            connect,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Reconnect automatically when an established connection goes down.
    pub fn set_retry(&self, on: bool) {
        self.retry.store(on, Ordering::SeqCst);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.with_driver(move |driver| driver.callbacks.borrow_mut().connection = cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.with_driver(move |driver| driver.callbacks.borrow_mut().message = cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.with_driver(move |driver| driver.callbacks.borrow_mut().write_complete = Some(cb));
    }

    /// Start connecting, with backoff on failure.
    pub fn connect(&self) {
        info!(
            "TcpClient [{}] connecting to {}",
            self.name, self.server_addr
        );
        self.connect.store(true, Ordering::SeqCst);
        self.with_driver(|driver| driver.connector.start_in_loop());
    }

    /// Shut down the live connection's write half, if any.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.with_driver(|driver| {
            if let Some(conn) = driver.connection.borrow().clone() {
                conn.shutdown();
            }
        });
    }

    /// Abort any in-flight connect attempt.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.with_driver(|driver| driver.connector.stop_in_loop());
    }

    fn with_driver(&self, f: impl FnOnce(&ClientDriver) + Send + 'static) {
        let driver_id = self.driver_id;
        self.handle.run_in_loop(move || {
            let driver = LoopCore::try_current()
                .and_then(|core| core.get_local(driver_id))
                .and_then(|local| local.downcast::<ClientDriver>().ok());
            if let Some(driver) = driver {
                f(&driver);
            }
        });
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let driver_id = self.driver_id;
        self.handle.run_in_loop(move || {
            if let Some(core) = LoopCore::try_current() {
                if let Some(local) = core.take_local(driver_id) {
                    if let Ok(driver) = local.downcast::<ClientDriver>() {
                        driver.connector.stop_in_loop();
                        if let Some(conn) = driver.connection.borrow().clone() {
                            // The close callback will no longer find the
                            // client; it falls back to plain destruction.
                            conn.force_close();
                        }
                    }
                }
            }
        });
    }
}
