//! Minimal HTTP/1.x layer on top of the TCP runtime: an incremental
//! request parser, a response serializer, and a server facade wiring them
//! to per-connection parser state.

mod context;
mod request;
mod response;
mod server;

pub use self::context::HttpContext;
pub use self::request::{HttpRequest, Method, Version};
pub use self::response::{HttpResponse, StatusCode};
pub use self::server::{HttpCallback, HttpServer};
