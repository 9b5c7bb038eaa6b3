use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::http::{HttpContext, HttpRequest, HttpResponse, StatusCode, Version};
use crate::{
    Buffer, EventLoop, ServerOption, TcpConnection, TcpServer, ThreadInitCallback, Timestamp,
};

/// Produces the response for one parsed request. Runs on the connection's
/// loop; must not block.
pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

fn default_http_callback(_request: &HttpRequest, response: &mut HttpResponse) {
    response.set_status_code(StatusCode::NotFound);
    response.set_status_message("Not Found");
    response.set_close_connection(true);
}

/// HTTP/1.x server facade: a [`TcpServer`] whose connections each carry an
/// [`HttpContext`] in their context slot.
pub struct HttpServer {
    server: TcpServer,
    http_callback: Arc<Mutex<HttpCallback>>,
}

enum ParseOutcome {
    BadRequest,
    Ready(HttpRequest),
    Incomplete,
}

impl HttpServer {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        name: &str,
        option: ServerOption,
    ) -> io::Result<HttpServer> {
        let server = TcpServer::new(event_loop, listen_addr, name, option)?;
        let http_callback: Arc<Mutex<HttpCallback>> =
            Arc::new(Mutex::new(Arc::new(default_http_callback)));

        server.set_connection_callback(Arc::new(on_connection));
        let callback = http_callback.clone();
        server.set_message_callback(Arc::new(move |conn, buf, receive_time| {
            on_message(conn, buf, receive_time, &callback);
        }));

        Ok(HttpServer {
            server,
            http_callback,
        })
    }

    pub fn set_http_callback(&self, cb: HttpCallback) {
        *self
            .http_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = cb;
    }

    pub fn set_thread_num(&self, thread_num: usize) {
        self.server.set_thread_num(thread_num);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.server.set_thread_init_callback(cb);
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }

    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.server.listen_addr()
    }

    pub fn start(&self) -> io::Result<()> {
        info!(
            "HttpServer [{}] starts listening on {}",
            self.server.name(),
            self.server.ip_port()
        );
        self.server.start()
    }
}

fn on_connection(conn: &TcpConnection) {
    if conn.connected() {
        conn.set_context(Box::new(HttpContext::new()));
    }
}

fn on_message(
    conn: &TcpConnection,
    buf: &mut Buffer,
    receive_time: Timestamp,
    callback: &Arc<Mutex<HttpCallback>>,
) {
    let outcome = conn.with_context::<HttpContext, _>(|context| {
        if !context.parse_request(buf, receive_time) {
            return ParseOutcome::BadRequest;
        }
        if context.got_all() {
            ParseOutcome::Ready(context.take_request())
        } else {
            ParseOutcome::Incomplete
        }
    });

    match outcome {
        None => warn!("{} has no HTTP context, dropping input", conn.name()),
        Some(ParseOutcome::BadRequest) => {
            conn.send(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            conn.shutdown();
        }
        Some(ParseOutcome::Ready(request)) => on_request(conn, &request, callback),
        Some(ParseOutcome::Incomplete) => {}
    }
}

fn on_request(conn: &TcpConnection, request: &HttpRequest, callback: &Arc<Mutex<HttpCallback>>) {
    let connection_header = request.header("Connection");
    let close = connection_header == Some("close")
        || (request.version() == Version::Http10 && connection_header != Some("Keep-Alive"));

    let mut response = HttpResponse::new(close);
    let callback = callback.lock().unwrap_or_else(|e| e.into_inner()).clone();
    callback(request, &mut response);

    let mut output = Buffer::new();
    response.append_to_buffer(&mut output);
    conn.send_buffer(&mut output);
    if response.close_connection() {
        conn.shutdown();
    }
}
