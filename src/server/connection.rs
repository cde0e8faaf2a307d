//! One client connection and its single request/response exchange

use super::error_pages;
use super::handler::{Exchange, Handler};
use super::router::Router;
use crate::cgi::Reaper;
use crate::http::{reason_phrase, HttpRequest, HttpResponse, ParseLimits, RequestState};
use crate::reactor::{ConnId, Event, Interest, IoStatus, Owner, Reactor, Socket};

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

/// Size of a single read from the client
const READ_SIZE: usize = 8192;

/// What the server should do with a connection after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close
}

/// A client socket, the exchange running over it, and the sockets the
/// exchange needs along the way.
///
/// The connection reads until the request is complete, hands it to a
/// handler, and writes once the response is complete. Its idle timer runs
/// while it waits on the client in either direction; while a handler runs,
/// the handler's own timer takes over.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    client: Socket,
    peer: SocketAddr,
    local: SocketAddr,
    router: Rc<Router>,
    request: HttpRequest,
    response: HttpResponse,
    handler: Option<Handler>,
    idle_timer: Socket,
    idle_timeout: Duration,
    /// Wire bytes of the response already sent
    written: usize,
    responding: bool
}

impl Connection {
    /// Registers `client` and its idle timer under `Owner::Connection(id)`
    pub fn open(id: ConnId, mut client: Socket, peer: SocketAddr, router: Rc<Router>,
                idle_timeout: Duration, reactor: &mut Reactor) -> io::Result<Connection>
    {
        let local = client.local_addr()?;
        let limits = ParseLimits {
            max_body_size: router.max_body_size(),
            ..ParseLimits::default()
        };
        let owner = Owner::Connection(id);

        let mut idle_timer = Socket::timer()?;
        idle_timer.arm(idle_timeout)?;

        reactor.register(&mut client, owner)?;
        if let Err(e) = reactor.register(&mut idle_timer, owner) {
            reactor.deregister(&client);
            return Err(e);
        }

        Ok(Connection {
            id,
            client,
            peer,
            local,
            router,
            request: HttpRequest::new(limits),
            response: HttpResponse::new(),
            handler: None,
            idle_timer,
            idle_timeout,
            written: 0,
            responding: false
        })
    }

    pub fn on_event(&mut self, event: &Event, reactor: &mut Reactor) -> Flow {
        if event.fd == self.idle_timer.fd() {
            return match self.idle_timer.acknowledge() {
                Ok(true) => {
                    info!("{}: idle for {:?}, closing", self.peer, self.idle_timeout);
                    Flow::Close
                },
                Ok(false) => Flow::Continue,
                Err(e) => {
                    warn!("{}: reading the idle timer failed: {}", self.peer, e);
                    Flow::Close
                }
            };
        }

        if event.fd == self.client.fd() {
            let flow = if self.responding {
                self.send()
            }
            else if self.request.state().is_terminal() {
                // Only hangups and errors arrive while a handler runs.
                if event.hangup || event.error {
                    debug!("{}: client went away while the handler ran", self.peer);
                    Flow::Close
                }
                else {
                    Flow::Continue
                }
            }
            else {
                self.receive(reactor)
            };

            if flow == Flow::Close {
                return flow;
            }
        }
        else if let Some(handler) = self.handler.as_mut().filter(|h| h.owns(event.fd)) {
            let mut ex = Exchange {
                request: &self.request,
                response: &mut self.response,
                reactor: &mut *reactor,
                owner: Owner::Connection(self.id),
                peer: self.peer,
                local: self.local
            };
            handler.on_event(event, &mut ex);
        }
        else {
            debug!("{}: event for fd {} nobody here owns", self.peer, event.fd);
        }

        self.progress(reactor)
    }

    fn receive(&mut self, reactor: &mut Reactor) -> Flow {
        let mut buf = [0u8; READ_SIZE];
        match self.client.read(&mut buf) {
            Ok(IoStatus::WouldBlock) => Flow::Continue,
            Ok(IoStatus::Ready(0)) => {
                debug!("{}: closed before finishing its request", self.peer);
                Flow::Close
            },
            Ok(IoStatus::Ready(n)) => {
                trace!("{}: read {} bytes", self.peer, n);
                self.request.receive_data(&buf[.. n]);

                match self.request.state() {
                    RequestState::ParseError => {
                        let scope = self.router.default_scope().cloned();
                        let status = self.request.error_status();
                        error_pages::apply(&mut self.response, status, scope.as_deref());
                    },
                    RequestState::Complete => self.dispatch(reactor),
                    _ => ()
                }
                Flow::Continue
            },
            Err(e) => {
                warn!("{}: read failed: {}", self.peer, e);
                Flow::Close
            }
        }
    }

    /// Hands the completed request to a handler. Whatever goes wrong, the
    /// response is left either complete or in the handler's care.
    fn dispatch(&mut self, reactor: &mut Reactor) {
        info!("{}: {} {} {}", self.peer, self.request.method(), self.request.target(),
              self.request.version());

        if let Err(e) = self.idle_timer.disarm() {
            warn!("{}: disarming the idle timer failed: {}", self.peer, e);
        }
        self.client.set_interest(Interest::None);

        let mut handler = match self.router.dispatch(&self.request) {
            Ok(handler) => handler,
            Err(rejection) => {
                info!("{}: rejected: {}", self.peer, rejection);
                rejection.respond(&mut self.response);
                return;
            }
        };

        let mut ex = Exchange {
            request: &self.request,
            response: &mut self.response,
            reactor: &mut *reactor,
            owner: Owner::Connection(self.id),
            peer: self.peer,
            local: self.local
        };
        if let Err(e) = handler.handle(&mut ex) {
            error!("{}: {} handler failed: {}", self.peer, handler.kind().name(), e);
            error_pages::apply(ex.response, 500, Some(&handler.route().scope));
        }

        self.handler = Some(handler);
    }

    /// Switches to writing once the response is complete
    fn progress(&mut self, reactor: &mut Reactor) -> Flow {
        if let Some(handler) = self.handler.as_mut() {
            handler.poll();
        }

        if !self.responding && self.response.is_complete() {
            if let Some(handler) = self.handler.as_mut() {
                handler.finish(reactor);
            }
            if self.request.method() == "HEAD" {
                self.response.omit_body();
            }

            let status = self.response.status();
            info!("{}: {} {}", self.peer, status, reason_phrase(status));

            self.responding = true;
            self.client.set_interest(Interest::Write);
            if let Err(e) = self.idle_timer.arm(self.idle_timeout) {
                warn!("{}: arming the idle timer failed: {}", self.peer, e);
            }
        }

        match reactor.update(&mut self.client) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!("{}: changing interest failed: {}", self.peer, e);
                Flow::Close
            }
        }
    }

    fn send(&mut self) -> Flow {
        let pending = self.response.to_bytes(self.written);
        if pending.is_empty() {
            return Flow::Close;
        }

        match self.client.write(pending) {
            Ok(IoStatus::Ready(n)) => {
                self.written += n;
                trace!("{}: wrote {} of {} bytes", self.peer, self.written,
                       self.response.wire_len());
                if self.written >= self.response.wire_len() {
                    debug!("{}: response sent", self.peer);
                    Flow::Close
                }
                else {
                    Flow::Continue
                }
            },
            Ok(IoStatus::WouldBlock) => Flow::Continue,
            Err(e) => {
                warn!("{}: write failed: {}", self.peer, e);
                Flow::Close
            }
        }
    }

    /// Releases the handler's sockets and process, then the timer, then the
    /// client itself
    pub fn close(self, reactor: &mut Reactor, reaper: &mut Reaper) {
        let Connection { id, client, peer, handler, idle_timer, .. } = self;

        if let Some(handler) = handler {
            handler.teardown(reactor, reaper);
        }
        reactor.deregister(&idle_timer);
        reactor.deregister(&client);

        debug!("{}: connection {} closed", peer, id);
    }
}
