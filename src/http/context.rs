use crate::http::request::{HttpRequest, Version};
use crate::{Buffer, Timestamp};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    GotAll,
}

/// Incremental request parser, one per connection.
///
/// Feed it the connection's input buffer on every message callback; it
/// consumes what it can and keeps its state across calls until a full
/// request is in. Returns `false` on a malformed request line, which the
/// server answers with a 400.
#[derive(Debug)]
pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
}

impl Default for HttpContext {
    fn default() -> HttpContext {
        HttpContext::new()
    }
}

impl HttpContext {
    pub fn new() -> HttpContext {
        HttpContext {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::new(),
        }
    }

    pub fn got_all(&self) -> bool {
        self.state == ParseState::GotAll
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Hand out the finished request and reset for the next one on the
    /// same connection.
    pub fn take_request(&mut self) -> HttpRequest {
        self.state = ParseState::ExpectRequestLine;
        std::mem::take(&mut self.request)
    }

    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request = HttpRequest::new();
    }

    pub fn parse_request(&mut self, buf: &mut Buffer, receive_time: Timestamp) -> bool {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    let Some(crlf) = buf.find_crlf() else {
                        return true; // wait for more bytes
                    };
                    let line = buf.peek()[..crlf].to_vec();
                    if !self.process_request_line(&line) {
                        return false;
                    }
                    self.request.set_receive_time(receive_time);
                    buf.retrieve(crlf + 2);
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let Some(crlf) = buf.find_crlf() else {
                        return true;
                    };
                    let line = buf.peek()[..crlf].to_vec();
                    match line.iter().position(|&b| b == b':') {
                        Some(colon) => {
                            let field = String::from_utf8_lossy(&line[..colon]).into_owned();
                            let value = String::from_utf8_lossy(&line[colon + 1..])
                                .trim()
                                .to_string();
                            self.request.add_header(field, value);
                        }
                        None => {
                            // Empty line: end of the header section.
                            self.state = ParseState::ExpectBody;
                        }
                    }
                    buf.retrieve(crlf + 2);
                }
                ParseState::ExpectBody => {
                    let body = buf.take_all();
                    if !body.is_empty() {
                        self.request.set_body(body);
                    }
                    self.state = ParseState::GotAll;
                    return true;
                }
                ParseState::GotAll => return true,
            }
        }
    }

    // METHOD SP PATH[?QUERY] SP HTTP/1.<0|1>
    fn process_request_line(&mut self, line: &[u8]) -> bool {
        let Ok(line) = std::str::from_utf8(line) else {
            return false;
        };
        let Some((method, rest)) = line.split_once(' ') else {
            return false;
        };
        if !self.request.set_method(method) {
            return false;
        }
        let Some((target, version)) = rest.split_once(' ') else {
            return false;
        };
        match version {
            "HTTP/1.1" => self.request.set_version(Version::Http11),
            "HTTP/1.0" => self.request.set_version(Version::Http10),
            _ => return false,
        }
        match target.find('?') {
            Some(question) => {
                self.request.set_path(&target[..question]);
                self.request.set_query(&target[question..]);
            }
            None => self.request.set_path(target),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn parse(bytes: &[u8]) -> (bool, HttpContext) {
        let mut buf = Buffer::new();
        buf.append(bytes);
        let mut context = HttpContext::new();
        let ok = context.parse_request(&mut buf, Timestamp::now());
        (ok, context)
    }

    #[test]
    fn full_get_request() {
        let (ok, context) = parse(
            b"GET /index.html?from=home HTTP/1.1\r\nHost: example.org\r\nUser-Agent:  agent  \r\n\r\n",
        );
        assert!(ok);
        assert!(context.got_all());
        let request = context.request();
        assert_eq!(request.method(), Some(Method::Get));
        assert_eq!(request.version(), Version::Http11);
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.query(), "?from=home");
        assert_eq!(request.header("Host"), Some("example.org"));
        // Header values lose their surrounding whitespace.
        assert_eq!(request.header("User-Agent"), Some("agent"));
        assert_eq!(request.header("Missing"), None);
        assert!(request.body().is_empty());
    }

    #[test]
    fn post_with_body() {
        let (ok, context) = parse(b"POST /submit HTTP/1.0\r\nHost: x\r\n\r\nkey=value");
        assert!(ok);
        assert!(context.got_all());
        let request = context.request();
        assert_eq!(request.method(), Some(Method::Post));
        assert_eq!(request.version(), Version::Http10);
        assert_eq!(request.body(), b"key=value");
    }

    #[test]
    fn incremental_across_reads() {
        let mut buf = Buffer::new();
        let mut context = HttpContext::new();

        buf.append(b"GET /a HT");
        assert!(context.parse_request(&mut buf, Timestamp::now()));
        assert!(!context.got_all());

        buf.append(b"TP/1.1\r\nHost: spl");
        assert!(context.parse_request(&mut buf, Timestamp::now()));
        assert!(!context.got_all());

        buf.append(b"it\r\n\r\n");
        assert!(context.parse_request(&mut buf, Timestamp::now()));
        assert!(context.got_all());
        assert_eq!(context.request().header("Host"), Some("split"));
    }

    #[test]
    fn bad_method_fails() {
        let (ok, _) = parse(b"FOO /x HTTP/1.1\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn bad_version_fails() {
        let (ok, _) = parse(b"GET /x HTTP/2.0\r\n\r\n");
        assert!(!ok);
        let (ok, _) = parse(b"GET /x HTTQ/1.1\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn missing_parts_fail() {
        let (ok, _) = parse(b"GET\r\n\r\n");
        assert!(!ok);
        let (ok, _) = parse(b"GET /only-path\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn take_request_resets() {
        let (ok, mut context) = parse(b"GET /first HTTP/1.1\r\n\r\n");
        assert!(ok && context.got_all());
        let first = context.take_request();
        assert_eq!(first.path(), "/first");
        assert!(!context.got_all());

        let mut buf = Buffer::new();
        buf.append(b"GET /second HTTP/1.1\r\n\r\n");
        assert!(context.parse_request(&mut buf, Timestamp::now()));
        assert!(context.got_all());
        assert_eq!(context.request().path(), "/second");
    }
}
