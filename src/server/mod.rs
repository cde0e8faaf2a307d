//! Server functionality
//!
//! `Server` owns the reactor, the listening sockets and every open
//! connection. Each turn waits for readiness, accepts whatever is pending on
//! ready listeners, routes every other event to the connection its owner tag
//! names, tears down connections that are done, and reaps killed CGI
//! children.

pub mod connection;
pub mod error_pages;
pub mod handler;
pub mod router;

mod delete;
mod redirect;
mod static_files;
mod upload;

use self::connection::{Connection, Flow};
use self::router::Router;
use crate::cgi::Reaper;
use crate::config::{Config, ServerConfig};
use crate::errors::{Error, Result};
use crate::reactor::{ConnId, Event, Owner, Reactor, Socket};

use indexmap::IndexMap;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

/// How long a turn may block while killed children wait to be reaped
const REAP_INTERVAL: Duration = Duration::from_millis(500);

struct Listener {
    socket: Socket,
    router: Rc<Router>,
    idle_timeout: Duration
}

pub struct Server {
    reactor: Reactor,
    listeners: Vec<Listener>,
    connections: HashMap<ConnId, Connection>,
    next_id: ConnId,
    reaper: Reaper
}

/// Binds every configured address and serves until a fatal error.
pub fn serve(config: Config) -> Result<()> {
    // Writes to vanished peers and children must fail with EPIPE instead.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut server = Server::bind(&config)?;
    for addr in server.local_addrs() {
        info!("Listening on {}", addr);
    }
    server.run()
}

impl Server {
    /// Opens one listening socket per distinct address. Servers sharing an
    /// address share the socket and are told apart by `Host`.
    pub fn bind(config: &Config) -> Result<Server> {
        let mut groups: IndexMap<SocketAddr, Vec<Rc<ServerConfig>>> = IndexMap::new();
        for server in &config.servers {
            groups.entry(server.listen_addr()).or_default().push(server.clone());
        }

        let mut reactor = Reactor::new()?;
        let mut listeners = Vec::with_capacity(groups.len());

        for (addr, servers) in groups {
            let mut socket = match Socket::listen(addr) {
                Ok(socket) => socket,
                Err(e) => {
                    error!("Could not listen on {}: {}", addr, e);
                    continue;
                }
            };
            reactor.register(&mut socket, Owner::Listener(listeners.len()))?;

            let idle_timeout = servers[0].scope().timeout();
            listeners.push(Listener {
                socket,
                router: Rc::new(Router::new(servers)),
                idle_timeout
            });
        }

        if listeners.is_empty() {
            return Err(Error::NoListeners);
        }

        Ok(Server {
            reactor,
            listeners,
            connections: HashMap::new(),
            next_id: 0,
            reaper: Reaper::new()
        })
    }

    /// Addresses actually bound, with any port 0 resolved
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter()
            .filter_map(|l| l.socket.local_addr().ok())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            let timeout = if self.reaper.is_empty() { None } else { Some(REAP_INTERVAL) };
            self.turn(timeout)?;
        }
    }

    /// Waits up to `timeout` for readiness and handles whatever arrives
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let events = self.reactor.poll(timeout)?;

        for event in &events {
            // An earlier event this turn may have closed the owner.
            if !self.reactor.is_current(event) {
                trace!("Skipping stale event for fd {}", event.fd);
                continue;
            }

            match event.owner {
                Owner::Listener(index) => self.accept(index),
                Owner::Connection(id) => self.on_connection_event(id, event)
            }
        }

        self.reaper.reap();
        Ok(())
    }

    fn accept(&mut self, index: usize) {
        let listener = match self.listeners.get(index) {
            Some(listener) => listener,
            None => return
        };

        loop {
            let (socket, peer) = match listener.socket.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            };

            let id = self.next_id;
            self.next_id += 1;

            match Connection::open(id, socket, peer, listener.router.clone(),
                                   listener.idle_timeout, &mut self.reactor) {
                Ok(connection) => {
                    self.connections.insert(id, connection);
                    debug!("{}: accepted as connection {} ({} open)", peer, id,
                           self.connection_count());
                },
                Err(e) => warn!("{}: could not set up the connection: {}", peer, e)
            }
        }
    }

    fn on_connection_event(&mut self, id: ConnId, event: &Event) {
        let flow = match self.connections.get_mut(&id) {
            Some(connection) => connection.on_event(event, &mut self.reactor),
            None => return
        };

        if flow == Flow::Close {
            if let Some(connection) = self.connections.remove(&id) {
                connection.close(&mut self.reactor, &mut self.reaper);
            }
        }
    }
}
