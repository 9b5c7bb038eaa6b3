//! Keel is a reactor-style, non-blocking TCP networking runtime: one
//! readiness-polling event loop per thread, application-buffered reads and
//! writes, timers multiplexed onto a single timer descriptor, and
//! composition facades for servers and clients. A minimal HTTP/1.x layer
//! sits on top as a representative protocol.
//!
//! The design is "one loop per thread": every connection lives on exactly
//! one [`EventLoop`] and all of its callbacks run there. Cross-thread work
//! is posted into the owning loop through a [`LoopHandle`], which wakes
//! the loop's readiness wait via an event descriptor. Callbacks must not
//! block; the only blocking waits in the runtime are the readiness wait
//! itself and the timer descriptor.
//!
//! Linux and Android (epoll, eventfd, timerfd) are the supported
//! platforms.
//!
//! # Example: an echo server
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use std::sync::Arc;
//! use keel::{EventLoop, ServerOption, TcpServer};
//!
//! let mut event_loop = EventLoop::new()?;
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! let server = TcpServer::new(&event_loop, &addr, "echo", ServerOption::NoReusePort)?;
//! server.set_thread_num(4);
//! server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
//!     let bytes = buf.take_all();
//!     conn.send(&bytes);
//! }));
//! server.start()?;
//! event_loop.run();
//! # Ok(())
//! # }
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("keel only supports epoll platforms (Linux and Android)");

// Macros used by the rest of the crate live in `sys`.
#[macro_use]
mod sys;

mod acceptor;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
pub mod http;
pub mod net;
mod pool;
mod poller;
mod server;
mod timer;
mod timestamp;

pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use client::TcpClient;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use event_loop::{EventLoop, LoopHandle};
pub use pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::{ServerOption, TcpServer};
pub use timer::TimerId;
pub use timestamp::Timestamp;
