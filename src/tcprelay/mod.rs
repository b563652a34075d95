//! TCP relay: accepts client connections and owns their sessions.
//!
//! Sessions are keyed by their client socket token. Once a session opens
//! its upstream socket, that token is routed back to the same session so
//! events for either side land in one place.

mod session;

pub use session::{Backpressure, Context, Session, Settings, Stage};

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use mio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{Mode, RelayConfig};
use crate::crypto::Cryptor;
use crate::dns::DnsResolver;
use crate::error::{Error, Result};
use crate::reactor::{Interest, Owner, Readiness, Registry, Token};
use crate::socks5::Address;

// errno values shared by Linux and the BSDs.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Listener plus every live TCP session.
pub struct TcpRelay {
    listener: Option<TcpListener>,
    listener_token: Option<Token>,
    accept_paused: bool,
    cryptor: Cryptor,
    settings: Settings,
    max_connections: usize,
    sessions: HashMap<Token, Session>,
    /// Upstream token to owning session key
    routes: HashMap<Token, Token>,
}

impl TcpRelay {
    /// Build the relay around an already bound listener.
    pub fn new(
        config: &RelayConfig,
        cryptor: Cryptor,
        listener: TcpListener,
        udp_addr: Option<SocketAddr>,
    ) -> Self {
        let upstream = match config.mode {
            Mode::Local => Some(match config.server.parse::<IpAddr>() {
                Ok(ip) => Address::Socket(SocketAddr::new(ip, config.server_port)),
                Err(_) => Address::Domain(config.server.clone(), config.server_port),
            }),
            Mode::Server => None,
        };

        Self {
            listener: Some(listener),
            listener_token: None,
            accept_paused: false,
            cryptor,
            settings: Settings {
                mode: config.mode,
                high_water: config.high_water,
                low_water: config.low_water,
                timeout: config.timeout,
                upstream,
                udp_addr,
            },
            max_connections: config.max_connections,
            sessions: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, registry: &mut Registry) -> Result<()> {
        if let Some(listener) = self.listener.as_mut() {
            self.listener_token = Some(registry.register(listener, Owner::Tcp, Interest::READABLE)?);
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// No listener and no sessions left.
    pub fn is_idle(&self) -> bool {
        self.listener.is_none() && self.sessions.is_empty()
    }

    pub fn on_event(
        &mut self,
        registry: &mut Registry,
        resolver: &mut DnsResolver,
        token: Token,
        ready: Readiness,
        now: Instant,
    ) {
        if Some(token) == self.listener_token {
            self.accept(registry, now);
            return;
        }

        let key = if self.sessions.contains_key(&token) {
            token
        } else if let Some(key) = self.routes.get(&token) {
            *key
        } else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };

        let mut cx = Context {
            registry: &mut *registry,
            resolver,
            settings: &self.settings,
            now,
        };
        let result = if token == key {
            session.on_client_ready(&mut cx, ready)
        } else {
            session.on_upstream_ready(&mut cx, ready)
        };
        self.settle(registry, key, result);
    }

    /// Hand a finished lookup to the session waiting on it.
    pub fn on_resolved(
        &mut self,
        registry: &mut Registry,
        resolver: &mut DnsResolver,
        key: Token,
        result: &Result<IpAddr>,
        now: Instant,
    ) {
        let Some(session) = self.sessions.get_mut(&key) else {
            debug!("Resolution for departed session {}", key.0);
            return;
        };
        let mut cx = Context {
            registry: &mut *registry,
            resolver,
            settings: &self.settings,
            now,
        };
        let result = session.on_resolved(&mut cx, result);
        self.settle(registry, key, result);
    }

    /// Idle sweep, plus resuming accepts after descriptor exhaustion.
    pub fn on_tick(&mut self, registry: &mut Registry, now: Instant) {
        if self.accept_paused {
            if let (Some(listener), Some(token)) = (self.listener.as_mut(), self.listener_token) {
                match registry.modify(listener, token, Some(Interest::READABLE)) {
                    Ok(()) => {
                        debug!("Resuming accepts");
                        self.accept_paused = false;
                    }
                    Err(e) => warn!("Failed to resume accepts: {}", e),
                }
            }
        }

        let timeout = self.settings.timeout;
        let expired: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now, timeout))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            debug!("Session {} idle for more than {:?}", key.0, timeout);
            if let Some(session) = self.sessions.get_mut(&key) {
                session.close(registry);
            }
            self.remove(key);
        }
    }

    /// Close the listener; existing sessions keep running.
    pub fn close_listener(&mut self, registry: &mut Registry) {
        if let Some(mut listener) = self.listener.take() {
            if let Some(token) = self.listener_token.take() {
                let _ = registry.unregister(&mut listener, token);
            }
            info!("TCP listener closed, {} sessions draining", self.sessions.len());
        }
    }

    /// Force-close every session.
    pub fn close_all(&mut self, registry: &mut Registry) {
        for session in self.sessions.values_mut() {
            session.close(registry);
        }
        self.sessions.clear();
        self.routes.clear();
    }

    fn accept(&mut self, registry: &mut Registry, now: Instant) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.sessions.len() >= self.max_connections {
                        let e = Error::exhausted(format!("{} connections open", self.max_connections));
                        warn!("Rejecting {}: {}", peer, e);
                        continue;
                    }
                    let token = match registry.register(&mut stream, Owner::Tcp, Interest::READABLE) {
                        Ok(token) => token,
                        Err(e) => {
                            warn!("Failed to register connection from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    debug!("Accepted {} as session {}", peer, token.0);
                    let session = Session::new(stream, token, &self.cryptor, &self.settings, now);
                    self.sessions.insert(token, session);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) if matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE)) => {
                    warn!("{}, pausing accepts", Error::exhausted(e.to_string()));
                    self.pause_accept(registry);
                    return;
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn pause_accept(&mut self, registry: &mut Registry) {
        if let (Some(listener), Some(token)) = (self.listener.as_mut(), self.listener_token) {
            if registry.modify(listener, token, None).is_ok() {
                self.accept_paused = true;
            }
        }
    }

    /// Apply the outcome of a session call: close on error, record a new
    /// upstream route, drop the session once closed.
    fn settle(&mut self, registry: &mut Registry, key: Token, result: Result<()>) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        if let Err(e) = result {
            if e.is_auth_failure() {
                warn!("Session {} failed authentication", key.0);
            } else if e.is_session_local() {
                debug!("Session {} error: {}", key.0, e);
            } else {
                warn!("Session {} aborted: {}", key.0, e);
            }
            session.close(registry);
        }
        if let Some(up) = session.upstream_token() {
            self.routes.insert(up, key);
        }
        if session.is_closed() {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: Token) {
        if let Some(session) = self.sessions.remove(&key) {
            if let Some(up) = session.upstream_token() {
                self.routes.remove(&up);
            }
        }
    }

    #[cfg(test)]
    fn route_count(&self) -> usize {
        self.routes.len()
    }
}
