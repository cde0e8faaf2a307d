//! Non-blocking descriptors the reactor can watch
//!
//! Every `Socket` is non-blocking and close-on-exec from construction on, so
//! a CGI child never inherits a client connection or another request's pipe.

use super::Interest;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Backlog for listening sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Which CGI stream a pipe carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Stdin,
    Stdout,
    Stderr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Listening,
    Connection,
    Timer,
    CgiPipe(PipeEnd)
}

/// Result of a read or write that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// This many bytes moved; a read of 0 is end of stream
    Ready(usize),
    /// Nothing can move until the next readiness event
    WouldBlock
}

#[derive(Debug)]
enum Handle {
    Listener(TcpListener),
    Stream(TcpStream),
    Raw(OwnedFd)
}

#[derive(Debug)]
pub struct Socket {
    handle: Handle,
    kind: SocketKind,
    interest: Interest,
    dirty: bool
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    }
    else {
        Ok(rc)
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn status_of(result: io::Result<usize>) -> io::Result<IoStatus> {
    match result {
        Ok(n) => Ok(IoStatus::Ready(n)),
        Err(ref e) if would_block(e) => Ok(IoStatus::WouldBlock),
        Err(e) => Err(e)
    }
}

impl Socket {
    fn new(handle: Handle, kind: SocketKind, interest: Interest) -> Socket {
        Socket { handle, kind, interest, dirty: false }
    }

    /// Binds a listening socket with `SO_REUSEADDR`
    pub fn listen(addr: SocketAddr) -> io::Result<Socket> {
        let socket = socket2::Socket::new(socket2::Domain::for_address(addr),
                                          socket2::Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        Ok(Socket::new(Handle::Listener(socket.into()), SocketKind::Listening,
                       Interest::Read))
    }

    /// Accepts one pending connection, `None` if there is none
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        let listener = match self.handle {
            Handle::Listener(ref l) => l,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput,
                                           "accept on a non-listening socket"))
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                let socket = Socket::new(Handle::Stream(stream), SocketKind::Connection,
                                         Interest::Read);
                Ok(Some((socket, peer)))
            },
            Err(ref e) if would_block(e) => Ok(None),
            Err(e) => Err(e)
        }
    }

    /// A disarmed single-shot timer on the monotonic clock
    pub fn timer() -> io::Result<Socket> {
        let fd = cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC,
                                 libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?;

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Socket::new(Handle::Raw(fd), SocketKind::Timer, Interest::Read))
    }

    /// Wraps the parent's end of a CGI pipe
    pub fn pipe(fd: OwnedFd, end: PipeEnd) -> io::Result<Socket> {
        let raw = fd.as_raw_fd();
        unsafe {
            let flags = cvt(libc::fcntl(raw, libc::F_GETFL))?;
            cvt(libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
            let fd_flags = cvt(libc::fcntl(raw, libc::F_GETFD))?;
            cvt(libc::fcntl(raw, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC))?;
        }

        let interest = match end {
            PipeEnd::Stdin => Interest::Write,
            PipeEnd::Stdout | PipeEnd::Stderr => Interest::Read
        };
        Ok(Socket::new(Handle::Raw(fd), SocketKind::CgiPipe(end), interest))
    }

    /// Starts (or restarts) the timer; it fires once after `after`
    pub fn arm(&mut self, after: Duration) -> io::Result<()> {
        // A zero it_value would disarm instead.
        let after = after.max(Duration::from_nanos(1));
        self.set_timer(libc::timespec {
            tv_sec: after.as_secs() as libc::time_t,
            tv_nsec: after.subsec_nanos() as libc::c_long
        })
    }

    pub fn disarm(&mut self) -> io::Result<()> {
        self.set_timer(libc::timespec { tv_sec: 0, tv_nsec: 0 })
    }

    fn set_timer(&mut self, value: libc::timespec) -> io::Result<()> {
        if self.kind != SocketKind::Timer {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                                      "not a timer"));
        }

        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: value
        };
        cvt(unsafe {
            libc::timerfd_settime(self.fd(), 0, &spec, std::ptr::null_mut())
        })?;
        Ok(())
    }

    /// Consumes a timer expiry; `false` if the timer had not actually fired
    pub fn acknowledge(&mut self) -> io::Result<bool> {
        let mut expirations = [0u8; 8];
        match self.read(&mut expirations)? {
            IoStatus::Ready(8) => Ok(true),
            _ => Ok(false)
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<IoStatus> {
        match self.handle {
            Handle::Stream(ref mut stream) => status_of(stream.read(buf)),
            Handle::Raw(ref fd) => {
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void,
                               buf.len())
                };
                status_of(if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) })
            },
            Handle::Listener(_) => Err(io::Error::new(io::ErrorKind::InvalidInput,
                                                      "read on a listening socket"))
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<IoStatus> {
        match self.handle {
            Handle::Stream(ref mut stream) => status_of(stream.write(buf)),
            Handle::Raw(ref fd) => {
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void,
                                buf.len())
                };
                status_of(if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) })
            },
            Handle::Listener(_) => Err(io::Error::new(io::ErrorKind::InvalidInput,
                                                      "write on a listening socket"))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.handle {
            Handle::Listener(ref l) => l.local_addr(),
            Handle::Stream(ref s) => s.local_addr(),
            Handle::Raw(_) => Err(io::Error::new(io::ErrorKind::InvalidInput,
                                                 "not a network socket"))
        }
    }

    pub fn fd(&self) -> RawFd {
        match self.handle {
            Handle::Listener(ref l) => l.as_raw_fd(),
            Handle::Stream(ref s) => s.as_raw_fd(),
            Handle::Raw(ref fd) => fd.as_raw_fd()
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Records a new interest; the reactor applies it on `update`
    pub fn set_interest(&mut self, interest: Interest) {
        if self.interest != interest {
            self.interest = interest;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(super) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
