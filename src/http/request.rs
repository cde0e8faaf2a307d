//! Incremental HTTP/1.1 request parser
//!
//! The parser is fed exactly the bytes each socket read produced and keeps
//! whatever it could not consume yet in an internal buffer. It never blocks
//! and never reads from anywhere itself.

use super::HttpHeaders;
use crate::log_util::{ascii_excerpt, LOG_EXCERPT};

/// Where the parser is in the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    RequestLine,
    Headers,
    Body,
    Chunked,
    Complete,
    ParseError
}

impl RequestState {
    /// `Complete` and `ParseError` accept no further input
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Complete | RequestState::ParseError)
    }
}

/// Caps applied while parsing the request head
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    /// Longest accepted header value
    pub max_header_size: usize,
    /// Most header lines accepted
    pub max_header_count: usize,
    /// Longest accepted request line plus header block
    pub max_head_size: usize,
    /// Largest body buffered before the request is refused with 413
    pub max_body_size: usize
}

impl Default for ParseLimits {
    fn default() -> ParseLimits {
        ParseLimits {
            max_header_size: 8192,
            max_header_count: 64,
            max_head_size: 64 * 1024,
            max_body_size: usize::MAX
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(usize),
    Trailer
}

/// A request being read off a connection
#[derive(Debug)]
pub struct HttpRequest {
    state: RequestState,
    method: String,
    target: String,
    version: String,
    headers: HttpHeaders,
    body: Vec<u8>,

    buffer: Vec<u8>,
    limits: ParseLimits,
    head_consumed: usize,
    header_count: usize,
    content_length: usize,
    chunk: ChunkPhase,
    /// Status a `ParseError` should be answered with
    error_status: u16
}

/// Outcome of one parsing step: `Ok(true)` if it made progress, `Ok(false)`
/// if it needs more bytes.
type Step = Result<bool, String>;

impl Default for HttpRequest {
    fn default() -> HttpRequest {
        HttpRequest::new(ParseLimits::default())
    }
}

impl HttpRequest {
    pub fn new(limits: ParseLimits) -> HttpRequest {
        HttpRequest {
            state: RequestState::RequestLine,
            method: String::new(),
            target: String::new(),
            version: String::new(),
            headers: HttpHeaders::new(),
            body: Vec::new(),
            buffer: Vec::new(),
            limits,
            head_consumed: 0,
            header_count: 0,
            content_length: 0,
            chunk: ChunkPhase::Size,
            error_status: 400
        }
    }

    /// Feeds bytes read from the client into the state machine
    pub fn receive_data(&mut self, data: &[u8]) {
        if self.state.is_terminal() {
            debug!("Ignoring {} bytes received after the request reached {:?}",
                   data.len(), self.state);
            return;
        }

        self.buffer.extend_from_slice(data);

        loop {
            let step = match self.state {
                RequestState::RequestLine => self.parse_request_line(),
                RequestState::Headers => self.parse_header_line(),
                RequestState::Body => self.parse_body(),
                RequestState::Chunked => self.parse_chunk(),
                RequestState::Complete | RequestState::ParseError => return
            };

            match step {
                Ok(true) => (),
                Ok(false) => {
                    if self.in_head() &&
                        self.head_consumed + self.buffer.len() > self.limits.max_head_size
                    {
                        self.fail(format!("request head exceeds {} bytes",
                                          self.limits.max_head_size));
                    }
                    else if self.in_chunk_line() && self.buffer.len() > self.limits.max_head_size {
                        self.fail(format!("chunk line exceeds {} bytes",
                                          self.limits.max_head_size));
                    }
                    return;
                },
                Err(reason) => {
                    self.fail(reason);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, reason: String) {
        warn!("Malformed request: {}", reason);
        self.state = RequestState::ParseError;
        self.buffer.clear();
    }

    fn in_head(&self) -> bool {
        matches!(self.state, RequestState::RequestLine | RequestState::Headers)
    }

    fn in_chunk_line(&self) -> bool {
        self.state == RequestState::Chunked && !matches!(self.chunk, ChunkPhase::Data(_))
    }

    /// Marks the body as over the limit; the caller turns the returned
    /// reason into a `ParseError`
    fn too_large(&mut self, size: usize) -> String {
        self.error_status = 413;
        format!("body of at least {} bytes exceeds {}", size, self.limits.max_body_size)
    }

    /// Removes and returns the next CRLF-terminated line, without the CRLF
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = find_crlf(&self.buffer)?;
        let mut line: Vec<u8> = self.buffer.drain(.. end + 2).collect();
        line.truncate(end);
        Some(line)
    }

    fn parse_request_line(&mut self) -> Step {
        let line = match self.take_line() {
            Some(line) => line,
            None => return Ok(false)
        };
        self.head_consumed += line.len() + 2;

        let text = std::str::from_utf8(&line).map_err(|_| {
            format!("request line is not UTF-8: {}", ascii_excerpt(&line, LOG_EXCERPT))
        })?;

        let parts: Vec<&str> = text.split(' ').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("request line {:?} does not have three parts",
                               ascii_excerpt(&line, LOG_EXCERPT)));
        }

        self.method = parts[0].to_string();
        self.target = parts[1].to_string();
        self.version = parts[2].to_string();
        trace!("Request line: {} {} {}", self.method, self.target, self.version);

        self.state = RequestState::Headers;
        Ok(true)
    }

    fn parse_header_line(&mut self) -> Step {
        let line = match self.take_line() {
            Some(line) => line,
            None => return Ok(false)
        };
        self.head_consumed += line.len() + 2;

        if line.is_empty() {
            return self.end_of_headers();
        }

        let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
            format!("header line without a colon: {}", ascii_excerpt(&line, LOG_EXCERPT))
        })?;

        let name = &line[.. colon];
        let value = trim_lwsp(&line[colon + 1 ..]);

        if name.is_empty() {
            return Err(String::from("header with an empty name"));
        }
        if !name.iter().all(|&b| is_token_char(b)) {
            return Err(format!("invalid header name {}", ascii_excerpt(name, LOG_EXCERPT)));
        }
        if value.first() == Some(&b':') {
            return Err(format!("header value begins with a colon: {}",
                               ascii_excerpt(&line, LOG_EXCERPT)));
        }
        if value.len() > self.limits.max_header_size {
            return Err(format!("header value longer than {} bytes",
                               self.limits.max_header_size));
        }

        self.header_count += 1;
        if self.header_count > self.limits.max_header_count {
            return Err(format!("more than {} header lines", self.limits.max_header_count));
        }

        // Token characters are ASCII, so the name is valid UTF-8.
        let name = String::from_utf8_lossy(name);
        let value = String::from_utf8_lossy(value);
        self.headers.add(&name, &value);
        Ok(true)
    }

    fn end_of_headers(&mut self) -> Step {
        let lengths = self.headers.get_all("Content-Length");
        let content_length = match lengths.first() {
            Some(first) => {
                if lengths.iter().any(|l| l != first) {
                    return Err(String::from("conflicting Content-Length headers"));
                }
                first.trim().parse::<usize>().map_err(|_| {
                    format!("invalid Content-Length {:?}", first)
                })?
            },
            None => 0
        };
        if content_length > self.limits.max_body_size {
            return Err(self.too_large(content_length));
        }

        let chunked = self.headers.joined("Transfer-Encoding")
            .map_or(false, |codings| {
                codings.rsplit(',').next()
                    .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"))
            });

        self.content_length = content_length;
        self.state = if content_length > 0 {
            RequestState::Body
        }
        else if chunked {
            RequestState::Chunked
        }
        else {
            RequestState::Complete
        };

        debug!("Request head parsed: {} {}, {} header(s), next state {:?}",
               self.method, self.target, self.headers.len(), self.state);
        Ok(true)
    }

    fn parse_body(&mut self) -> Step {
        if self.buffer.len() < self.content_length {
            return Ok(false);
        }

        self.body = self.buffer.drain(.. self.content_length).collect();
        if !self.buffer.is_empty() {
            debug!("Discarding {} bytes past the declared body", self.buffer.len());
            self.buffer.clear();
        }

        self.state = RequestState::Complete;
        Ok(true)
    }

    fn parse_chunk(&mut self) -> Step {
        match self.chunk {
            ChunkPhase::Size => {
                let line = match self.take_line() {
                    Some(line) => line,
                    None => return Ok(false)
                };

                let size_field = line.split(|&b| b == b';').next().unwrap_or(&[]);
                let size = std::str::from_utf8(trim_lwsp(size_field)).ok()
                    .and_then(|s| usize::from_str_radix(s, 16).ok())
                    .ok_or_else(|| {
                        format!("invalid chunk size {}", ascii_excerpt(&line, LOG_EXCERPT))
                    })?;

                if size.checked_add(2).is_none() {
                    return Err(format!("chunk size {} out of range", size));
                }
                if size > self.limits.max_body_size.saturating_sub(self.body.len()) {
                    let total = self.body.len().saturating_add(size);
                    return Err(self.too_large(total));
                }

                self.chunk = if size == 0 {
                    ChunkPhase::Trailer
                }
                else {
                    ChunkPhase::Data(size)
                };
                Ok(true)
            },
            ChunkPhase::Data(size) => {
                if self.buffer.len() < size + 2 {
                    return Ok(false);
                }
                if &self.buffer[size .. size + 2] != b"\r\n" {
                    return Err(String::from("chunk data not followed by CRLF"));
                }

                self.body.extend_from_slice(&self.buffer[.. size]);
                self.buffer.drain(.. size + 2);
                self.chunk = ChunkPhase::Size;
                Ok(true)
            },
            ChunkPhase::Trailer => {
                let line = match self.take_line() {
                    Some(line) => line,
                    None => return Ok(false)
                };

                if line.is_empty() {
                    if !self.buffer.is_empty() {
                        debug!("Discarding {} bytes past the chunked body",
                               self.buffer.len());
                        self.buffer.clear();
                    }
                    self.state = RequestState::Complete;
                }
                Ok(true)
            }
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == RequestState::Complete
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 413 if the body outgrew `max_body_size`, otherwise 400. Only
    /// meaningful in `ParseError`.
    pub fn error_status(&self) -> u16 {
        self.error_status
    }

    /// The declared `Content-Length`, if any
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("Content-Length").and_then(|l| l.trim().parse().ok())
    }

    /// The `Host` header without any port
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get("Host")?;
        let host = if host.starts_with('[') {
            host.split(']').next().map(|h| &h[1 ..]).unwrap_or(host)
        }
        else {
            host.split(':').next().unwrap_or(host)
        };
        Some(host.trim())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn trim_lwsp(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

/// `tchar` from RFC 7230
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(input: &[u8]) -> HttpRequest {
        let mut request = HttpRequest::default();
        request.receive_data(input);
        request
    }

    #[test]
    fn parse_request_basic() {
        let request = parse(b"GET / HTTP/1.1\r\nHost: google.com\r\nUser-Agent: curl/7.47.1\r\nAccept: */*\r\n\r\n");

        assert_eq!(request.state(), RequestState::Complete);
        assert_eq!(request.method(), "GET");
        assert_eq!(request.target(), "/");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.headers().get("user-agent"), Some("curl/7.47.1"));
        assert_eq!(request.host(), Some("google.com"));
        assert!(request.body().is_empty());
    }

    #[test]
    fn parse_request_does_not_percent_decode() {
        let request = parse(b"GET /%20 HTTP/1.1\r\n\r\n");
        assert_eq!(request.target(), "/%20");
    }

    #[test]
    fn parse_request_fails_on_bad_bytes() {
        let request = parse(b"GET /bogon\xff HTTP/1.1\r\n");
        assert_eq!(request.state(), RequestState::ParseError);
    }

    #[test]
    fn request_line_needs_three_single_spaced_parts() {
        assert_eq!(parse(b"GET /\r\n").state(), RequestState::ParseError);
        assert_eq!(parse(b"GET  / HTTP/1.1\r\n").state(), RequestState::ParseError);
        assert_eq!(parse(b"GET / HTTP/1.1 extra\r\n").state(), RequestState::ParseError);
    }

    #[test]
    fn byte_at_a_time_matches_all_at_once() {
        let raw: &[u8] = b"POST /form HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut request = HttpRequest::default();
        for byte in raw {
            assert!(!request.state().is_terminal());
            request.receive_data(&[*byte]);
        }

        assert_eq!(request.state(), RequestState::Complete);
        assert_eq!(request.body(), b"hello");
    }

    #[test]
    fn body_length_gating() {
        let mut request = parse(b"PUT /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabcd");
        assert_eq!(request.state(), RequestState::Body);

        request.receive_data(b"efghij");
        assert_eq!(request.state(), RequestState::Complete);
        assert_eq!(request.body().len(), 10);
    }

    #[test]
    fn excess_bytes_are_not_part_of_the_body() {
        let request = parse(b"PUT /x HTTP/1.1\r\nContent-Length: 2\r\n\r\nabcd");
        assert_eq!(request.body(), b"ab");
    }

    #[test]
    fn terminal_states_ignore_further_input() {
        let mut request = parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        request.receive_data(b"GET /other HTTP/1.1\r\nX-More: 1\r\n\r\n");
        assert_eq!(request.state(), RequestState::Complete);
        assert_eq!(request.target(), "/");
        assert!(!request.headers().has("x-more"));
        assert!(request.body().is_empty());

        let mut broken = parse(b"GET / HTTP/1.1\r\nno colon here\r\n");
        assert_eq!(broken.state(), RequestState::ParseError);
        broken.receive_data(b"Host: x\r\n\r\n");
        assert_eq!(broken.state(), RequestState::ParseError);
        assert!(!broken.headers().has("host"));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let cases: &[&[u8]] = &[
            b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",
            b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",
            b"GET / HTTP/1.1\r\n: empty-name\r\n\r\n",
            b"GET / HTTP/1.1\r\nX-Colon: :value\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
        ];

        for case in cases {
            assert_eq!(parse(case).state(), RequestState::ParseError,
                       "{}", String::from_utf8_lossy(case));
        }
    }

    #[test]
    fn header_limits() {
        let limits = ParseLimits {
            max_header_size: 4,
            max_header_count: 2,
            max_head_size: 1024,
            ..ParseLimits::default()
        };

        let mut long = HttpRequest::new(limits);
        long.receive_data(b"GET / HTTP/1.1\r\nX: 12345\r\n\r\n");
        assert_eq!(long.state(), RequestState::ParseError);

        let mut many = HttpRequest::new(limits);
        many.receive_data(b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n");
        assert_eq!(many.state(), RequestState::ParseError);
    }

    #[test]
    fn oversized_heads_are_rejected_before_completion() {
        let limits = ParseLimits { max_head_size: 32, ..ParseLimits::default() };
        let mut request = HttpRequest::new(limits);
        request.receive_data(b"GET /a-very-long-target-that-never-ends");
        assert_eq!(request.state(), RequestState::ParseError);
    }

    #[test]
    fn chunked_bodies() {
        let mut request = parse(b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n");
        assert_eq!(request.state(), RequestState::Chunked);

        request.receive_data(b"5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n");
        assert_eq!(request.state(), RequestState::Complete);
        assert_eq!(request.body(), b"Wikipedia");
    }

    #[test]
    fn chunked_bodies_reject_bad_sizes() {
        let request = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        assert_eq!(request.state(), RequestState::ParseError);
    }

    #[test]
    fn chunk_sizes_near_the_integer_limit_fail_cleanly() {
        let request = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab");
        assert_eq!(request.state(), RequestState::ParseError);
        assert_eq!(request.error_status(), 400);
        assert!(request.body().is_empty());

        let request = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffffe\r\nab");
        assert_eq!(request.state(), RequestState::Chunked);
        assert!(request.body().is_empty());
    }

    #[test]
    fn endless_chunk_size_lines_are_rejected() {
        let limits = ParseLimits { max_head_size: 64, ..ParseLimits::default() };
        let mut request = HttpRequest::new(limits);
        request.receive_data(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        request.receive_data(&[b'0'; 100]);
        assert_eq!(request.state(), RequestState::ParseError);
    }

    #[test]
    fn declared_bodies_over_the_limit_are_refused_up_front() {
        let limits = ParseLimits { max_body_size: 8, ..ParseLimits::default() };
        let mut request = HttpRequest::new(limits);
        request.receive_data(b"PUT /x HTTP/1.1\r\nContent-Length: 9\r\n\r\n");
        assert_eq!(request.state(), RequestState::ParseError);
        assert_eq!(request.error_status(), 413);

        let mut request = HttpRequest::new(limits);
        request.receive_data(b"PUT /x HTTP/1.1\r\nContent-Length: 8\r\n\r\n12345678");
        assert_eq!(request.state(), RequestState::Complete);
    }

    #[test]
    fn chunked_bodies_stop_at_the_limit() {
        let limits = ParseLimits { max_body_size: 1024, ..ParseLimits::default() };
        let mut request = HttpRequest::new(limits);
        request.receive_data(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");

        let chunk = [b'x'; 256];
        for _ in 0 .. 4 {
            request.receive_data(b"100\r\n");
            request.receive_data(&chunk);
            request.receive_data(b"\r\n");
        }
        assert_eq!(request.state(), RequestState::Chunked);
        assert_eq!(request.body().len(), 1024);

        request.receive_data(b"1\r\n");
        assert_eq!(request.state(), RequestState::ParseError);
        assert_eq!(request.error_status(), 413);
        assert_eq!(request.body().len(), 1024);

        request.receive_data(&chunk);
        assert_eq!(request.body().len(), 1024);
    }

    #[test]
    fn host_without_port() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").host(),
                   Some("example.com"));
        assert_eq!(parse(b"GET / HTTP/1.1\r\nHost: [::1]:80\r\n\r\n").host(),
                   Some("::1"));
        assert_eq!(parse(b"GET / HTTP/1.0\r\n\r\n").host(), None);
    }
}
