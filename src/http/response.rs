use std::collections::BTreeMap;

use crate::Buffer;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum StatusCode {
    #[default]
    Unknown,
    Ok,
    MovedPermanently,
    BadRequest,
    NotFound,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Unknown => 0,
            StatusCode::Ok => 200,
            StatusCode::MovedPermanently => 301,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
        }
    }
}

/// A response under construction; serialized into a [`Buffer`] for the
/// wire.
#[derive(Debug)]
pub struct HttpResponse {
    status_code: StatusCode,
    status_message: String,
    close_connection: bool,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(close_connection: bool) -> HttpResponse {
        HttpResponse {
            status_code: StatusCode::Unknown,
            status_message: String::new(),
            close_connection,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status_code(&mut self, code: StatusCode) {
        self.status_code = code;
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn set_status_message(&mut self, message: &str) {
        self.status_message = message.to_string();
    }

    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    /// Whether the server shuts the connection down after flushing this
    /// response.
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.add_header("Content-Type", content_type);
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Serialize: status line, `Connection`, `Content-Length`, the
    /// remaining headers, a blank line, then the body.
    pub fn append_to_buffer(&self, output: &mut Buffer) {
        output.append(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status_code.code(),
                self.status_message
            )
            .as_bytes(),
        );
        if self.close_connection {
            output.append(b"Connection: close\r\n");
        } else {
            output.append(b"Connection: Keep-Alive\r\n");
        }
        output.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        for (key, value) in &self.headers {
            output.append(format!("{}: {}\r\n", key, value).as_bytes());
        }
        output.append(b"\r\n");
        output.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(response: &HttpResponse) -> Vec<u8> {
        let mut output = Buffer::new();
        response.append_to_buffer(&mut output);
        output.take_all()
    }

    #[test]
    fn ok_response_round_trips() {
        let mut response = HttpResponse::new(false);
        response.set_status_code(StatusCode::Ok);
        response.set_status_message("OK");
        response.set_content_type("text/html");
        response.add_header("Server", "keel");
        response.set_body("<html></html>");

        let wire = serialize(&response);
        let text = std::str::from_utf8(&wire).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let mut lines = head.split("\r\n");

        assert_eq!(lines.next(), Some("HTTP/1.1 200 OK"));
        let headers: Vec<&str> = lines.collect();
        assert!(headers.contains(&"Connection: Keep-Alive"));
        assert!(headers.contains(&"Content-Length: 13"));
        assert!(headers.contains(&"Content-Type: text/html"));
        assert!(headers.contains(&"Server: keel"));
        assert_eq!(body, "<html></html>");
        assert_eq!(body.len(), 13);
    }

    #[test]
    fn close_response() {
        let mut response = HttpResponse::new(true);
        response.set_status_code(StatusCode::NotFound);
        response.set_status_message("Not Found");

        let wire = serialize(&response);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn body_bytes_unchanged() {
        let mut response = HttpResponse::new(false);
        response.set_status_code(StatusCode::Ok);
        response.set_status_message("OK");
        let payload: Vec<u8> = (0u8..=255).collect();
        response.set_body(payload.clone());

        let wire = serialize(&response);
        assert!(wire.ends_with(&payload));
    }
}
