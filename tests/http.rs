mod util;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use keel::http::{HttpServer, StatusCode};
use keel::{EventLoop, LoopHandle, ServerOption};

const INDEX_BODY: &str = "<html><body>hello</body></html>";

fn start_http_server() -> (SocketAddr, LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let server = HttpServer::new(
            &event_loop,
            &util::any_local_addr(),
            "http-test",
            ServerOption::NoReusePort,
        )
        .unwrap();
        server.set_http_callback(Arc::new(|request, response| {
            if request.path() == "/index.html" {
                response.set_status_code(StatusCode::Ok);
                response.set_status_message("OK");
                response.set_content_type("text/html");
                response.set_body(INDEX_BODY);
            } else {
                response.set_status_code(StatusCode::NotFound);
                response.set_status_message("Not Found");
                response.set_close_connection(true);
            }
        }));
        server.start().unwrap();
        tx.send((server.listen_addr().unwrap(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, join)
}

#[test]
fn get_returns_200_with_content_length() {
    util::init();
    let (addr, handle, join) = start_http_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let reply = util::read_http_reply(&mut stream);
    assert_eq!(reply.status_line, "HTTP/1.1 200 OK");
    assert_eq!(
        reply.header("Content-Length"),
        Some(INDEX_BODY.len().to_string().as_str())
    );
    assert_eq!(reply.header("Connection"), Some("Keep-Alive"));
    assert_eq!(reply.body, INDEX_BODY.as_bytes());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    util::init();
    let (addr, handle, join) = start_http_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    for _ in 0..3 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let reply = util::read_http_reply(&mut stream);
        assert_eq!(reply.status_line, "HTTP/1.1 200 OK");
        assert_eq!(reply.body, INDEX_BODY.as_bytes());
    }

    handle.quit();
    join.join().unwrap();
}

#[test]
fn bad_method_gets_400_and_a_closed_connection() {
    util::init();
    let (addr, handle, join) = start_http_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"FOO /x HTTP/1.1\r\n\r\n").unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"HTTP/1.1 400 Bad Request\r\n\r\n");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn http10_without_keep_alive_closes() {
    util::init();
    let (addr, handle, join) = start_http_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /index.html HTTP/1.0\r\nHost: x\r\n\r\n")
        .unwrap();

    let reply = util::read_http_reply(&mut stream);
    assert_eq!(reply.status_line, "HTTP/1.1 200 OK");
    assert_eq!(reply.header("Connection"), Some("close"));
    // After the framed body, the server closes.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn not_found_path_gets_404() {
    util::init();
    let (addr, handle, join) = start_http_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let reply = util::read_http_reply(&mut stream);
    assert_eq!(reply.status_line, "HTTP/1.1 404 Not Found");
    assert_eq!(reply.header("Connection"), Some("close"));

    handle.quit();
    join.join().unwrap();
}
