//! The response being constructed by a handler
//!
//! A response collects a status, headers and a body, and is sealed with
//! `set_complete`. The wire form is produced on the first `to_bytes` call and
//! cached, so a connection can drain it across many partial writes by
//! passing how far it has got.

use super::{reason_phrase, HttpHeaders, SERVER_SOFTWARE};

use std::cell::OnceCell;
use std::time::SystemTime;

/// Headers the serializer writes itself; handler copies are dropped
const MANAGED_HEADERS: [&str; 4] = ["Content-Length", "Date", "Connection", "Server"];

#[derive(Debug)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    complete: bool,
    omit_body: bool,
    wire: OnceCell<Vec<u8>>
}

impl Default for HttpResponse {
    fn default() -> HttpResponse {
        HttpResponse::new()
    }
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: HttpHeaders::new(),
            body: Vec::new(),
            complete: false,
            omit_body: false,
            wire: OnceCell::new()
        }
    }

    fn sealed(&self, what: &str) -> bool {
        if self.complete {
            warn!("Ignoring {} on a completed {} response", what, self.status);
        }
        self.complete
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, code: u16) {
        if self.sealed("status change") {
            return;
        }
        self.status = code;
        self.wire.take();
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.sealed("header") {
            return;
        }
        self.headers.add(name, value);
        self.wire.take();
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.sealed("header") {
            return;
        }
        self.headers.set(name, value);
        self.wire.take();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        if self.sealed("body replacement") {
            return;
        }
        self.body = body;
        self.wire.take();
    }

    /// Drops everything a handler put in so far, back to an empty 200
    pub fn reset(&mut self) {
        if self.sealed("reset") {
            return;
        }
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.wire.take();
    }

    /// Keeps the body out of the wire form while `Content-Length` still
    /// reports its size, as HEAD requires
    pub fn omit_body(&mut self) {
        self.omit_body = true;
        self.wire.take();
    }

    pub fn set_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The wire form from `offset` on
    pub fn to_bytes(&self, offset: usize) -> &[u8] {
        let wire = self.wire.get_or_init(|| self.serialize());
        &wire[offset.min(wire.len()) ..]
    }

    /// Length of the complete wire form
    pub fn wire_len(&self) -> usize {
        self.to_bytes(0).len()
    }

    fn serialize(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str(&format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())));
        head.push_str("Connection: close\r\n");
        head.push_str(&format!("Server: {}\r\n", SERVER_SOFTWARE));

        for (name, values) in self.headers.iter() {
            if MANAGED_HEADERS.iter().any(|m| m.eq_ignore_ascii_case(name)) {
                continue;
            }
            for value in values {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        head.push_str("\r\n");

        let mut wire = head.into_bytes();
        if !self.omit_body {
            wire.extend_from_slice(&self.body);
        }
        wire
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hello() -> HttpResponse {
        let mut response = HttpResponse::new();
        response.add_header("Content-Type", "text/plain");
        response.set_body(b"hi".to_vec());
        response.set_complete();
        response
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn serializes_status_line_headers_and_body() {
        let response = hello();
        let wire = response.to_bytes(0);

        assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(contains(wire, b"Content-Length: 2\r\n"));
        assert!(contains(wire, b"Content-Type: text/plain\r\n"));
        assert!(contains(wire, b"Connection: close\r\n"));
        assert!(contains(wire, b"\r\nDate: "));
        assert!(contains(wire, b"\r\nServer: reactor-httpd/"));
        assert!(wire.ends_with(b"\r\n\r\nhi"));
    }

    #[test]
    fn partial_writes_resume_from_offset() {
        let response = hello();
        let whole = response.to_bytes(0).to_vec();

        for k in 0 ..= whole.len() {
            assert_eq!(response.to_bytes(k), &whole[k ..]);
        }
        assert!(response.to_bytes(whole.len() + 10).is_empty());
    }

    #[test]
    fn completed_responses_reject_mutation() {
        let mut response = hello();
        let before = response.to_bytes(0).to_vec();

        response.set_body(b"other".to_vec());
        response.add_header("X-Late", "1");
        response.set_status(500);
        response.reset();

        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"hi");
        assert!(!response.headers().has("x-late"));
        assert_eq!(response.to_bytes(0), &before[..]);
    }

    #[test]
    fn set_complete_is_idempotent() {
        let mut response = hello();
        response.set_complete();
        assert!(response.is_complete());
    }

    #[test]
    fn managed_headers_are_not_duplicated() {
        let mut response = HttpResponse::new();
        response.add_header("content-length", "999");
        response.add_header("Connection", "keep-alive");
        response.set_complete();

        let wire = response.to_bytes(0);
        assert!(contains(wire, b"Content-Length: 0\r\n"));
        assert!(!contains(wire, b"999"));
        assert!(!contains(wire, b"keep-alive"));
    }

    #[test]
    fn head_responses_keep_the_length_but_not_the_body() {
        let mut response = HttpResponse::new();
        response.set_body(b"0123456789".to_vec());
        response.omit_body();
        response.set_complete();

        let wire = response.to_bytes(0);
        assert!(contains(wire, b"Content-Length: 10\r\n"));
        assert!(wire.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn multi_valued_headers_are_separate_lines() {
        let mut response = HttpResponse::new();
        response.add_header("Set-Cookie", "a=1");
        response.add_header("set-cookie", "b=2");

        let wire = response.to_bytes(0);
        assert!(contains(wire, b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n"));
    }
}
