//! The handler variants and the state they share

use super::router::Route;
use super::{delete, error_pages, redirect, static_files, upload};
use crate::cgi::{CgiHandler, Reaper};
use crate::errors::Result;
use crate::http::{HttpRequest, HttpResponse};
use crate::reactor::{Event, Owner, Reactor, Socket};

use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Everything a handler may touch while it runs
pub struct Exchange<'a> {
    pub request: &'a HttpRequest,
    pub response: &'a mut HttpResponse,
    pub reactor: &'a mut Reactor,
    /// Tag for sockets the handler registers
    pub owner: Owner,
    pub peer: SocketAddr,
    pub local: SocketAddr
}

#[derive(Debug)]
pub enum Kind {
    Static,
    Delete,
    Redirect,
    Upload,
    Cgi(CgiHandler)
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match *self {
            Kind::Static => "static",
            Kind::Delete => "delete",
            Kind::Redirect => "redirect",
            Kind::Upload => "upload",
            Kind::Cgi(_) => "cgi"
        }
    }
}

/// One handler bound to one routed request.
///
/// Static, delete, redirect and upload finish inside `handle`. A CGI
/// handler returns with the response still open and is advanced by events
/// on its pipes, under a deadline kept by its own timer.
#[derive(Debug)]
pub struct Handler {
    kind: Kind,
    route: Route,
    timer: Option<Socket>
}

impl Handler {
    pub fn new(kind: Kind, route: Route) -> Handler {
        Handler { kind, route, timer: None }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Runs the handler; errors are failures the caller answers with 500
    pub fn handle(&mut self, ex: &mut Exchange) -> Result<()> {
        match self.kind {
            Kind::Static => static_files::serve(&self.route, ex),
            Kind::Delete => delete::handle(&self.route, ex),
            Kind::Redirect => redirect::handle(&self.route, ex),
            Kind::Upload => upload::handle(&self.route, ex),
            Kind::Cgi(ref mut cgi) => cgi.handle(&self.route, ex)?
        }

        if !ex.response.is_complete() {
            self.start_timer(ex.reactor, ex.owner)?;
        }
        Ok(())
    }

    fn start_timer(&mut self, reactor: &mut Reactor, owner: Owner) -> Result<()> {
        let after = match self.kind {
            Kind::Cgi(_) => self.route.scope.cgi_timeout(),
            _ => self.route.scope.timeout()
        };

        let mut timer = Socket::timer()?;
        timer.arm(after)?;
        reactor.register(&mut timer, owner)?;
        trace!("{} handler gives up in {:?}", self.kind.name(), after);

        self.timer = Some(timer);
        Ok(())
    }

    /// Whether `fd` belongs to this handler
    pub fn owns(&self, fd: RawFd) -> bool {
        if self.timer.as_ref().map_or(false, |t| t.fd() == fd) {
            return true;
        }
        match self.kind {
            Kind::Cgi(ref cgi) => cgi.owns(fd),
            _ => false
        }
    }

    pub fn on_event(&mut self, event: &Event, ex: &mut Exchange) {
        if let Some(timer) = self.timer.as_mut().filter(|t| t.fd() == event.fd) {
            match timer.acknowledge() {
                Ok(true) => self.on_timeout(ex),
                Ok(false) => (),
                Err(e) => warn!("Reading the {} handler's timer failed: {}",
                                self.kind.name(), e)
            }
            return;
        }

        if let Kind::Cgi(ref mut cgi) = self.kind {
            cgi.on_event(event, &self.route, ex);
        }
    }

    /// The deadline passed; leaves the response complete
    pub fn on_timeout(&mut self, ex: &mut Exchange) {
        info!("{}: {} handler timed out", ex.peer, self.kind.name());

        match self.kind {
            Kind::Cgi(ref mut cgi) => cgi.on_timeout(&self.route, ex),
            _ => {
                if !ex.response.is_complete() {
                    error_pages::apply(ex.response, 504, Some(&self.route.scope));
                }
            }
        }
        self.finish(ex.reactor);
    }

    /// Catches up on anything that changed without an event
    pub fn poll(&mut self) {
        if let Kind::Cgi(ref mut cgi) = self.kind {
            cgi.poll();
        }
    }

    /// The response is complete; the deadline no longer applies
    pub fn finish(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.timer.take() {
            reactor.deregister(&timer);
        }
    }

    /// Releases every socket and process the handler holds
    pub fn teardown(mut self, reactor: &mut Reactor, reaper: &mut Reaper) {
        self.finish(reactor);
        if let Kind::Cgi(cgi) = self.kind {
            cgi.teardown(reactor, reaper);
        }
    }
}
