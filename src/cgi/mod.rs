//! The CGI/1.1 gateway
//!
//! A `CgiHandler` spawns the script, plugs the three pipes into the reactor
//! under its connection's owner tag, and then advances one step per
//! readiness event: request body into stdin, stdout into the output buffer,
//! stderr into the log. The response is finished once the header block has
//! been seen and stdout has either hit EOF or delivered the
//! `Content-Length` the script declared.

pub mod environment;
pub mod parser;
pub mod process;

pub use self::environment::CgiEnvironment;
pub use self::process::{spawn_subprocess, CgiProcess, Reaper, Spawned};

use crate::config::Scope;
use crate::errors::{Error, Result};
use crate::filesystem;
use crate::http::HttpResponse;
use crate::log_util::{ascii_excerpt, LOG_EXCERPT};
use crate::reactor::{Event, IoStatus, PipeEnd, Reactor, Socket};
use crate::server::error_pages;
use crate::server::handler::Exchange;
use crate::server::router::Route;

use std::ffi::OsString;
use std::fs;
use std::mem;
use std::os::fd::RawFd;

/// Most request body bytes offered to stdin per write
const CHUNK_SIZE: usize = 65536;
/// Size of a single read from stdout or stderr
const BUFFER_SIZE: usize = 8192;

/// Script headers the response builder writes itself
const NOT_FORWARDED: [&str; 4] = ["Content-Length", "Connection", "Date", "Server"];

/// A status line
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: String
}

/// Other headers
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub content: String
}

#[derive(Debug, Default)]
pub struct CgiHandler {
    process: Option<CgiProcess>,
    stdin: Option<Socket>,
    stdout: Option<Socket>,
    stderr: Option<Socket>,

    /// Request body bytes already written to stdin
    written: usize,
    /// Stdout not yet moved into the response
    output: Vec<u8>,
    headers_parsed: bool,
    declared_length: Option<usize>,
    explicit_status: bool,
    has_location: bool,
    finished: bool
}

impl CgiHandler {
    pub fn new() -> CgiHandler {
        CgiHandler::default()
    }

    /// Starts the script `route` resolved to.
    ///
    /// Errors are spawn or registration failures; the caller answers 500.
    /// Problems with the script itself are answered here.
    pub fn handle(&mut self, route: &Route, ex: &mut Exchange) -> Result<()> {
        let script = match route.script.as_ref().map(fs::canonicalize) {
            Some(Ok(script)) => script,
            Some(Err(e)) => {
                warn!("{}: cannot resolve CGI script: {}", ex.peer, e);
                error_pages::apply(ex.response, 404, Some(&route.scope));
                return Ok(());
            },
            None => {
                error_pages::apply(ex.response, 404, Some(&route.scope));
                return Ok(());
            }
        };

        let interpreter = filesystem::extension(&script)
            .and_then(|ext| route.scope.cgi_interpreter(ext))
            .unwrap_or("");

        let mut argv = Vec::with_capacity(2);
        if interpreter.is_empty() {
            if !filesystem::is_executable(&script) {
                warn!("{}: CGI script {} is not executable", ex.peer, script.display());
                error_pages::apply(ex.response, 403, Some(&route.scope));
                return Ok(());
            }
        }
        else {
            argv.push(OsString::from(interpreter));
        }
        argv.push(script.clone().into_os_string());

        let env = CgiEnvironment::build(ex.request, route, ex.peer, ex.local);
        let Spawned { child, stdin, stdout, stderr } =
            spawn_subprocess(&argv, env.iter(), script.parent()).map_err(Error::Spawn)?;

        let process = CgiProcess::new(child);
        let pid = process.pid();
        info!("{}: started CGI process {} for {}", ex.peer, pid, script.display());
        self.process = Some(process);

        let mut out = Socket::pipe(stdout, PipeEnd::Stdout)?;
        ex.reactor.register(&mut out, ex.owner)?;
        self.stdout = Some(out);

        let mut err = Socket::pipe(stderr, PipeEnd::Stderr)?;
        ex.reactor.register(&mut err, ex.owner)?;
        self.stderr = Some(err);

        if ex.request.body().is_empty() {
            debug!("Closing stdin of CGI process {} at once: empty body", pid);
            drop(stdin);
        }
        else {
            let mut input = Socket::pipe(stdin, PipeEnd::Stdin)?;
            ex.reactor.register(&mut input, ex.owner)?;
            self.stdin = Some(input);
        }

        Ok(())
    }

    fn pid(&self) -> u32 {
        self.process.as_ref().map_or(0, CgiProcess::pid)
    }

    fn pipe(&self, end: PipeEnd) -> &Option<Socket> {
        match end {
            PipeEnd::Stdin => &self.stdin,
            PipeEnd::Stdout => &self.stdout,
            PipeEnd::Stderr => &self.stderr
        }
    }

    fn which(&self, fd: RawFd) -> Option<PipeEnd> {
        [PipeEnd::Stdin, PipeEnd::Stdout, PipeEnd::Stderr].into_iter()
            .find(|&end| self.pipe(end).as_ref().map_or(false, |s| s.fd() == fd))
    }

    /// Whether `fd` is one of this handler's pipes
    pub fn owns(&self, fd: RawFd) -> bool {
        self.which(fd).is_some()
    }

    /// Advances whichever pipe `event` is about
    pub fn on_event(&mut self, event: &Event, route: &Route, ex: &mut Exchange) {
        match self.which(event.fd) {
            Some(PipeEnd::Stdin) => self.write_stdin(ex),
            Some(PipeEnd::Stdout) => self.read_stdout(route, ex),
            Some(PipeEnd::Stderr) => self.drain_stderr(ex.reactor),
            None => debug!("CGI process {} got an event for unknown fd {}",
                           self.pid(), event.fd)
        }
    }

    fn close_pipe(&mut self, end: PipeEnd, reactor: &mut Reactor) {
        let pipe = match end {
            PipeEnd::Stdin => self.stdin.take(),
            PipeEnd::Stdout => self.stdout.take(),
            PipeEnd::Stderr => self.stderr.take()
        };

        if let Some(pipe) = pipe {
            reactor.deregister(&pipe);
            trace!("Closed {:?} of CGI process {}", end, self.pid());
        }
    }

    fn close_pipes(&mut self, reactor: &mut Reactor) {
        self.close_pipe(PipeEnd::Stdin, reactor);
        self.close_pipe(PipeEnd::Stdout, reactor);
        self.close_pipe(PipeEnd::Stderr, reactor);
    }

    fn write_stdin(&mut self, ex: &mut Exchange) {
        let pid = self.pid();
        let body = ex.request.body();
        let pipe = match self.stdin.as_mut() {
            Some(pipe) => pipe,
            None => return
        };

        if self.written < body.len() {
            let end = (self.written + CHUNK_SIZE).min(body.len());
            match pipe.write(&body[self.written .. end]) {
                Ok(IoStatus::Ready(n)) => {
                    self.written += n;
                    trace!("Wrote {} of {} body bytes to CGI process {}",
                           self.written, body.len(), pid);
                },
                Ok(IoStatus::WouldBlock) => return,
                Err(e) => {
                    warn!("Writing to stdin of CGI process {} failed: {}", pid, e);
                    self.close_pipe(PipeEnd::Stdin, ex.reactor);
                    return;
                }
            }
        }

        if self.written >= body.len() {
            debug!("Request body fully sent to CGI process {}", pid);
            self.close_pipe(PipeEnd::Stdin, ex.reactor);
        }
    }

    fn read_stdout(&mut self, route: &Route, ex: &mut Exchange) {
        let mut buf = [0u8; BUFFER_SIZE];
        let status = match self.stdout.as_mut() {
            Some(pipe) => pipe.read(&mut buf),
            None => return
        };

        match status {
            Ok(IoStatus::WouldBlock) => (),
            Ok(IoStatus::Ready(0)) => {
                debug!("EOF on stdout of CGI process {}", self.pid());
                self.close_pipe(PipeEnd::Stdout, ex.reactor);
                self.finish_output(&route.scope, ex.response);
            },
            Ok(IoStatus::Ready(n)) => {
                if self.absorb(&buf[.. n], ex.response) {
                    self.close_pipe(PipeEnd::Stdout, ex.reactor);
                    self.finalize(&route.scope, ex.response);
                }
            },
            Err(e) => {
                error!("Reading stdout of CGI process {} failed: {}", self.pid(), e);
                self.close_pipe(PipeEnd::Stdout, ex.reactor);
                self.finish_output(&route.scope, ex.response);
            }
        }
    }

    fn drain_stderr(&mut self, reactor: &mut Reactor) {
        let pid = self.pid();
        let mut buf = [0u8; BUFFER_SIZE];
        let status = match self.stderr.as_mut() {
            Some(pipe) => pipe.read(&mut buf),
            None => return
        };

        match status {
            Ok(IoStatus::WouldBlock) => (),
            Ok(IoStatus::Ready(0)) => {
                trace!("EOF on stderr of CGI process {}", pid);
                self.close_pipe(PipeEnd::Stderr, reactor);
            },
            Ok(IoStatus::Ready(n)) => {
                for line in buf[.. n].split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
                    warn!("CGI process {} stderr: {}", pid, ascii_excerpt(line, LOG_EXCERPT));
                }
            },
            Err(e) => {
                warn!("Reading stderr of CGI process {} failed: {}", pid, e);
                self.close_pipe(PipeEnd::Stderr, reactor);
            }
        }
    }

    /// Takes in a piece of stdout. Returns `true` once the declared
    /// `Content-Length` has fully arrived.
    fn absorb(&mut self, data: &[u8], response: &mut HttpResponse) -> bool {
        self.output.extend_from_slice(data);
        if !self.headers_parsed {
            self.parse_headers(response);
        }

        self.headers_parsed &&
            self.declared_length.map_or(false, |len| self.output.len() >= len)
    }

    /// Stdout is done: one last look for headers, then finish
    fn finish_output(&mut self, scope: &Scope, response: &mut HttpResponse) {
        if !self.headers_parsed {
            self.parse_headers(response);
        }
        self.finalize(scope, response);
    }

    fn parse_headers(&mut self, response: &mut HttpResponse) {
        let (end, separator) = match parser::find_header_end(&self.output) {
            Some(found) => found,
            None => return
        };

        let block: Vec<u8> = self.output.drain(.. end + separator).collect();
        for line in parser::header_lines(&block[.. end]) {
            match parser::header(line) {
                Ok((_, header)) => self.apply_header(header, response),
                Err(_) => warn!("Ignoring malformed header line from CGI process {}: {}",
                                self.pid(), ascii_excerpt(line, LOG_EXCERPT))
            }
        }

        self.headers_parsed = true;
    }

    fn apply_header(&mut self, header: Header, response: &mut HttpResponse) {
        let Header { name, content } = header;

        if name.eq_ignore_ascii_case("Status") {
            match parser::status(content.as_bytes()) {
                Ok((_, status)) if (100 .. 600).contains(&status.code) => {
                    response.set_status(status.code);
                    self.explicit_status = true;
                },
                _ => warn!("Ignoring malformed Status {:?} from CGI process {}",
                           content, self.pid())
            }
        }
        else if name.eq_ignore_ascii_case("Content-Length") {
            match content.trim().parse::<usize>() {
                Ok(length) => self.declared_length = Some(length),
                Err(_) => warn!("Ignoring malformed Content-Length {:?} from CGI process {}",
                                content, self.pid())
            }
        }
        else if NOT_FORWARDED.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
            debug!("Dropping {} header from CGI process {}", name, self.pid());
        }
        else {
            if name.eq_ignore_ascii_case("Location") {
                self.has_location = true;
            }
            response.add_header(&name, &content);
        }
    }

    fn finalize(&mut self, scope: &Scope, response: &mut HttpResponse) {
        if self.finished {
            return;
        }
        self.finished = true;

        let pid = self.pid();
        let failed = match self.process.as_mut() {
            Some(process) => {
                process.poll_exit();
                process.failed()
            },
            None => false
        };

        if !self.headers_parsed && self.output.is_empty() {
            warn!("CGI process {} produced no output", pid);
            error_pages::apply(response, 502, Some(scope));
            return;
        }

        if !self.headers_parsed {
            warn!("CGI process {} sent no header block; passing its output on as the body",
                  pid);
        }

        if failed && !self.explicit_status {
            warn!("CGI process {} exited unsuccessfully without a Status header", pid);
            response.set_status(500);
        }
        else if self.has_location && !self.explicit_status {
            response.set_status(302);
        }

        if let Some(length) = self.declared_length {
            self.output.truncate(length);
        }

        response.set_body(mem::take(&mut self.output));
        response.set_complete();
        debug!("CGI process {} answered {} with {} body bytes",
               pid, response.status(), response.body().len());
    }

    /// Kills the script and answers 504
    pub fn on_timeout(&mut self, route: &Route, ex: &mut Exchange) {
        warn!("{}: CGI process {} timed out", ex.peer, self.pid());

        if let Some(process) = self.process.as_mut() {
            process.kill();
        }
        self.close_pipes(ex.reactor);
        self.finished = true;

        if !ex.response.is_complete() {
            error_pages::apply(ex.response, 504, Some(&route.scope));
        }
    }

    /// Notices a child exit without blocking
    pub fn poll(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.poll_exit();
        }
    }

    /// Deregisters whatever pipes are left and retires the child
    pub fn teardown(mut self, reactor: &mut Reactor, reaper: &mut Reaper) {
        self.close_pipes(reactor);
        if let Some(process) = self.process.take() {
            process.retire(reaper);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ScopeKind;

    use std::collections::BTreeMap;
    use std::thread;
    use std::time::{Duration, Instant};

    fn scope() -> Scope {
        Scope::new(ScopeKind::Server, toml::Table::new(), None)
    }

    fn run(chunks: &[&[u8]]) -> HttpResponse {
        let mut cgi = CgiHandler::new();
        let mut response = HttpResponse::new();
        for chunk in chunks {
            if cgi.absorb(chunk, &mut response) {
                break;
            }
        }
        cgi.finish_output(&scope(), &mut response);
        response
    }

    #[test]
    fn headers_split_across_reads() {
        let response = run(&[b"Content-Type: text/pl", b"ain\r\n", b"\r\nhello"]);

        assert!(response.is_complete());
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("content-type"), Some("text/plain"));
        assert_eq!(response.body(), b"hello");
    }

    #[test]
    fn status_header_sets_the_code_and_is_not_forwarded() {
        let response = run(&[b"Status: 404 Not Found\nContent-Type: text/plain\n\nnope"]);

        assert_eq!(response.status(), 404);
        assert!(!response.headers().has("status"));
        assert_eq!(response.body(), b"nope");
    }

    #[test]
    fn declared_length_finishes_early_and_truncates() {
        let mut cgi = CgiHandler::new();
        let mut response = HttpResponse::new();

        assert!(!cgi.absorb(b"Content-Length: 5\r\n\r\nabc", &mut response));
        assert!(cgi.absorb(b"defgh", &mut response));
        cgi.finalize(&scope(), &mut response);

        assert_eq!(response.body(), b"abcde");
        assert!(!response.headers().has("content-length"));
    }

    #[test]
    fn location_without_status_redirects() {
        let response = run(&[b"Location: /elsewhere\r\n\r\n"]);

        assert_eq!(response.status(), 302);
        assert_eq!(response.headers().get("Location"), Some("/elsewhere"));
    }

    #[test]
    fn missing_header_block_becomes_the_body() {
        let response = run(&[b"just some text"]);

        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"just some text");
    }

    #[test]
    fn no_output_is_a_bad_gateway() {
        let response = run(&[]);
        assert_eq!(response.status(), 502);
        assert!(response.is_complete());
    }

    #[test]
    fn managed_headers_are_dropped() {
        let response = run(&[b"Connection: keep-alive\r\nServer: evil\r\nX-Ok: 1\r\n\r\n"]);

        assert!(!response.headers().has("connection"));
        assert!(!response.headers().has("server"));
        assert_eq!(response.headers().get("x-ok"), Some("1"));
    }

    #[test]
    fn failed_children_without_status_become_500() {
        let env: BTreeMap<String, String> = BTreeMap::new();
        let argv = vec![OsString::from("/bin/sh"), OsString::from("-c"), OsString::from("exit 1")];
        let spawned = spawn_subprocess(&argv, &env, None).unwrap();

        let mut process = CgiProcess::new(spawned.child);
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.poll_exit().is_none() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }

        let mut cgi = CgiHandler::new();
        cgi.process = Some(process);
        let mut response = HttpResponse::new();
        cgi.absorb(b"Content-Type: text/plain\r\n\r\noops", &mut response);
        cgi.finish_output(&scope(), &mut response);

        assert_eq!(response.status(), 500);
        assert_eq!(response.body(), b"oops");
    }
}
