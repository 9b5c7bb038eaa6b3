use std::collections::HashMap;

use crate::Timestamp;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    pub(crate) fn from_str(method: &str) -> Option<Method> {
        match method {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Version {
    #[default]
    Unknown,
    Http10,
    Http11,
}

/// A parsed request: request line, headers, body, and the receive time of
/// the bytes that completed the request line.
#[derive(Debug, Default)]
pub struct HttpRequest {
    method: Option<Method>,
    version: Version,
    path: String,
    query: String,
    receive_time: Timestamp,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest::default()
    }

    pub(crate) fn set_method(&mut self, method: &str) -> bool {
        debug_assert!(self.method.is_none());
        self.method = Method::from_str(method);
        self.method.is_some()
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_query(&mut self, query: &str) {
        self.query = query.to_string();
    }

    /// The query string, including the leading `?`; empty when absent.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub(crate) fn set_receive_time(&mut self, time: Timestamp) {
        self.receive_time = time;
    }

    pub fn receive_time(&self) -> Timestamp {
        self.receive_time
    }

    pub(crate) fn add_header(&mut self, field: String, value: String) {
        self.headers.insert(field, value);
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers.get(field).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
