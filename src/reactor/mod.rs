//! Single-threaded readiness reactor over epoll
//!
//! The reactor never owns a socket. Owners register their sockets together
//! with an `Owner` tag, and each registration gets a fresh generation number
//! that travels through epoll's user data next to the fd. An event whose
//! generation no longer matches the live registration for its fd belongs to
//! a socket that was closed (and its fd possibly reused) earlier in the same
//! turn, and is dropped.
//!
//! Interest changes are not applied when they are requested. A socket marks
//! itself dirty and its owner calls `update` once its callback has returned.

pub mod socket;

pub use self::socket::{IoStatus, PipeEnd, Socket, SocketKind};

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

const MAX_EVENTS: usize = 256;

/// Identifies a connection for the lifetime of the server
pub type ConnId = u64;

/// What a socket wants to be woken up for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    None,
    Read,
    Write
}

impl Interest {
    fn epoll_flags(self) -> u32 {
        match self {
            Interest::None => 0,
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32
        }
    }
}

/// Who gets told about readiness on a registered fd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Index into the server's listener table
    Listener(usize),
    Connection(ConnId)
}

/// One readiness notification
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub owner: Owner,
    generation: u32,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool
}

#[derive(Debug)]
struct Registration {
    generation: u32,
    owner: Owner
}

pub struct Reactor {
    epoll: OwnedFd,
    registrations: HashMap<RawFd, Registration>,
    next_generation: u32,
    events: Vec<libc::epoll_event>
}

fn token(fd: RawFd, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(fd as u32)
}

fn untoken(token: u64) -> (RawFd, u32) {
    ((token & 0xffff_ffff) as u32 as RawFd, (token >> 32) as u32)
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Reactor {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            registrations: HashMap::new(),
            next_generation: 0,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS]
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events: flags, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        }
        else {
            Ok(())
        }
    }

    /// Starts watching `socket` for its current interest.
    ///
    /// # Panics
    ///
    /// If the fd is already registered. Two owners for one fd is a bug in
    /// the caller, not a runtime condition.
    pub fn register(&mut self, socket: &mut Socket, owner: Owner) -> io::Result<()> {
        let fd = socket.fd();
        assert!(!self.is_registered(fd),
                "fd {} registered twice (owner {:?})", fd, owner);

        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;

        self.ctl(libc::EPOLL_CTL_ADD, fd, socket.interest().epoll_flags(),
                 token(fd, generation))?;
        self.registrations.insert(fd, Registration { generation, owner });
        socket.mark_clean();

        trace!("Registered fd {} ({:?}) for {:?} as {:?}", fd, socket.kind(),
               socket.interest(), owner);
        Ok(())
    }

    /// Applies a pending interest change, if the socket has one
    pub fn update(&mut self, socket: &mut Socket) -> io::Result<()> {
        if !socket.is_dirty() {
            return Ok(());
        }

        let fd = socket.fd();
        let generation = match self.registrations.get(&fd) {
            Some(registration) => registration.generation,
            None => {
                socket.mark_clean();
                return Ok(());
            }
        };

        self.ctl(libc::EPOLL_CTL_MOD, fd, socket.interest().epoll_flags(),
                 token(fd, generation))?;
        socket.mark_clean();

        trace!("fd {} now waits for {:?}", fd, socket.interest());
        Ok(())
    }

    /// Stops watching `socket`; a no-op if it is not registered
    pub fn deregister(&mut self, socket: &Socket) {
        let fd = socket.fd();
        if self.registrations.remove(&fd).is_none() {
            return;
        }

        if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            debug!("epoll_ctl(DEL) on fd {} failed: {}", fd, e);
        }
        trace!("Deregistered fd {} ({:?})", fd, socket.kind());
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.contains_key(&fd)
    }

    /// Number of registered fds
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// `false` once the registration `event` was delivered for is gone
    pub fn is_current(&self, event: &Event) -> bool {
        self.registrations.get(&event.fd)
            .map_or(false, |r| r.generation == event.generation)
    }

    /// Blocks until something is ready or `timeout` passes.
    ///
    /// `None` waits forever. An interrupted wait returns no events.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1
        };

        let count = unsafe {
            libc::epoll_wait(self.epoll.as_raw_fd(), self.events.as_mut_ptr(),
                             self.events.len() as libc::c_int, timeout_ms)
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::with_capacity(count as usize);
        for raw in &self.events[.. count as usize] {
            let flags = raw.events;
            let (fd, generation) = untoken(raw.u64);

            let owner = match self.registrations.get(&fd) {
                Some(r) if r.generation == generation => r.owner,
                _ => {
                    trace!("Dropping stale event for fd {}", fd);
                    continue;
                }
            };

            ready.push(Event {
                fd,
                owner,
                generation,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                hangup: flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0
            });
        }

        Ok(ready)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        assert_eq!(untoken(token(7, 3)), (7, 3));
        assert_eq!(untoken(token(i32::MAX, u32::MAX)), (i32::MAX, u32::MAX));
    }

    #[test]
    fn timer_fires_once_through_the_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let mut timer = Socket::timer().unwrap();
        timer.arm(Duration::from_millis(10)).unwrap();
        reactor.register(&mut timer, Owner::Connection(1)).unwrap();

        let events = reactor.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, timer.fd());
        assert_eq!(events[0].owner, Owner::Connection(1));
        assert!(events[0].readable);
        assert!(timer.acknowledge().unwrap());

        let events = reactor.poll(Some(Duration::from_millis(30))).unwrap();
        assert!(events.is_empty());
        assert!(!timer.acknowledge().unwrap());
    }

    #[test]
    fn deregistered_sockets_make_events_stale() {
        let mut reactor = Reactor::new().unwrap();
        let mut timer = Socket::timer().unwrap();
        timer.arm(Duration::from_millis(1)).unwrap();
        reactor.register(&mut timer, Owner::Connection(9)).unwrap();

        let events = reactor.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(reactor.is_current(&events[0]));

        reactor.deregister(&timer);
        assert!(!reactor.is_current(&events[0]));
        assert!(!reactor.is_registered(timer.fd()));

        // Removing it again is harmless.
        reactor.deregister(&timer);
        assert!(reactor.is_empty());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_is_a_bug() {
        let mut reactor = Reactor::new().unwrap();
        let mut timer = Socket::timer().unwrap();
        reactor.register(&mut timer, Owner::Connection(1)).unwrap();
        reactor.register(&mut timer, Owner::Connection(2)).unwrap();
    }

    #[test]
    fn interest_changes_wait_for_update() {
        let mut reactor = Reactor::new().unwrap();
        let mut timer = Socket::timer().unwrap();
        reactor.register(&mut timer, Owner::Connection(1)).unwrap();

        timer.set_interest(Interest::None);
        assert!(timer.is_dirty());
        reactor.update(&mut timer).unwrap();
        assert!(!timer.is_dirty());

        timer.arm(Duration::from_millis(1)).unwrap();
        let events = reactor.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }
}
