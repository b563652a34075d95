//! UDP relay with a per-client NAT table.
//!
//! Every client endpoint gets its own upstream socket, so replies arriving
//! on that socket can be mapped back to the client without inspecting them.
//! The table is an LRU ordered by activity: a datagram in either direction
//! promotes its entry, and the idle sweep only ever has to look at the
//! least recently used end.
//!
//! Local mode unwraps SOCKS5 UDP requests and forwards the address header
//! plus payload, encrypted as one packet, to the relay server. Server mode
//! decrypts, sends the payload to the target, and wraps replies with the
//! source address before encrypting them back.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use lru::LruCache;
use mio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::config::{Mode, RelayConfig};
use crate::crypto::Cryptor;
use crate::dns::{DnsResolver, Lookup, Waiter};
use crate::error::{Error, Result};
use crate::reactor::{Interest, Owner, Readiness, Registry, Token};
use crate::socks5::{self, Address};

const MAX_DATAGRAM: usize = 65_536;

/// Datagram parked until its target host resolves.
struct Queued {
    host: String,
    port: u16,
    payload: Vec<u8>,
}

struct UdpSession {
    socket: UdpSocket,
    token: Token,
    last_activity: Instant,
    queue: VecDeque<Queued>,
}

/// Client-facing UDP socket and the NAT table behind it.
pub struct UdpRelay {
    socket: Option<UdpSocket>,
    token: Option<Token>,
    bind_v6: bool,
    mode: Mode,
    cryptor: Cryptor,
    /// Relay server (local mode only)
    upstream: Option<Address>,
    timeout: Duration,
    queue_limit: usize,
    sessions: LruCache<SocketAddr, UdpSession>,
    routes: HashMap<Token, SocketAddr>,
}

impl UdpRelay {
    pub fn new(config: &RelayConfig, cryptor: Cryptor, socket: UdpSocket) -> Result<Self> {
        let bind_v6 = socket.local_addr()?.is_ipv6();
        let upstream = match config.mode {
            Mode::Local => Some(match config.server.parse::<IpAddr>() {
                Ok(ip) => Address::Socket(SocketAddr::new(ip, config.server_port)),
                Err(_) => Address::Domain(config.server.clone(), config.server_port),
            }),
            Mode::Server => None,
        };

        Ok(Self {
            socket: Some(socket),
            token: None,
            bind_v6,
            mode: config.mode,
            cryptor,
            upstream,
            timeout: config.timeout,
            queue_limit: config.udp_queue_limit,
            sessions: LruCache::unbounded(),
            routes: HashMap::new(),
        })
    }

    pub fn register(&mut self, registry: &mut Registry) -> Result<()> {
        if let Some(socket) = self.socket.as_mut() {
            self.token = Some(registry.register(socket, Owner::Udp, Interest::READABLE)?);
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn on_event(
        &mut self,
        registry: &mut Registry,
        resolver: &mut DnsResolver,
        token: Token,
        _ready: Readiness,
        now: Instant,
    ) {
        if Some(token) == self.token {
            self.read_clients(registry, resolver, now);
        } else if let Some(client) = self.routes.get(&token).copied() {
            self.read_upstream(client, now);
        }
    }

    /// Send or drop whatever `client` queued for `hostname`.
    pub fn on_resolved(
        &mut self,
        client: SocketAddr,
        hostname: &str,
        result: &Result<IpAddr>,
        now: Instant,
    ) {
        let bind_v6 = self.bind_v6;
        let Some(session) = self.sessions.get_mut(&client) else {
            return;
        };

        let (ready, rest): (Vec<Queued>, Vec<Queued>) = session
            .queue
            .drain(..)
            .partition(|q| q.host.eq_ignore_ascii_case(hostname));
        session.queue.extend(rest);

        match result {
            Ok(ip) => {
                session.last_activity = now;
                for queued in ready {
                    let target = SocketAddr::new(*ip, queued.port);
                    send_upstream(&session.socket, bind_v6, target, &queued.payload);
                }
            }
            Err(e) => debug!(
                "Dropping {} datagrams from {}: {} unresolved ({})",
                ready.len(),
                client,
                hostname,
                e
            ),
        }
    }

    /// Evict sessions idle for longer than the timeout.
    pub fn on_tick(&mut self, registry: &mut Registry, now: Instant) {
        let timeout = self.timeout;
        while let Some((_, session)) = self.sessions.peek_lru() {
            if now.duration_since(session.last_activity) <= timeout {
                break;
            }
            if let Some((client, session)) = self.sessions.pop_lru() {
                debug!("UDP session for {} idle, evicting", client);
                self.release(registry, session);
            }
        }
    }

    /// Close the client-facing socket and every session.
    pub fn close(&mut self, registry: &mut Registry) {
        if let Some(mut socket) = self.socket.take() {
            if let Some(token) = self.token.take() {
                let _ = registry.unregister(&mut socket, token);
            }
            info!("UDP relay closed, {} sessions dropped", self.sessions.len());
        }
        while let Some((_, session)) = self.sessions.pop_lru() {
            self.release(registry, session);
        }
    }

    fn release(&mut self, registry: &mut Registry, mut session: UdpSession) {
        self.routes.remove(&session.token);
        if let Err(e) = registry.unregister(&mut session.socket, session.token) {
            debug!("Unregister UDP session {} failed: {}", session.token.0, e);
        }
    }

    fn read_clients(&mut self, registry: &mut Registry, resolver: &mut DnsResolver, now: Instant) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            let (n, client) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    return;
                }
            };
            if let Err(e) = self.on_client_datagram(registry, resolver, client, &buf[..n], now) {
                if e.is_auth_failure() {
                    warn!("Dropping UDP datagram from {}: {}", client, e);
                } else {
                    debug!("Dropping UDP datagram from {}: {}", client, e);
                }
            }
        }
    }

    fn on_client_datagram(
        &mut self,
        registry: &mut Registry,
        resolver: &mut DnsResolver,
        client: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<()> {
        let (target, payload) = match self.mode {
            Mode::Local => {
                let request = socks5::parse_udp_request(datagram)?;
                trace!("UDP {} -> {} ({} bytes)", client, request.target, request.payload.len());
                let sealed = self.cryptor.encrypt_packet(request.body)?;
                let server = self
                    .upstream
                    .clone()
                    .ok_or_else(|| Error::config("local mode without a remote server"))?;
                (server, sealed)
            }
            Mode::Server => {
                let plain = self.cryptor.decrypt_packet(datagram)?;
                let (target, used) = Address::parse(&plain)?
                    .ok_or_else(|| Error::protocol("UDP header truncated"))?;
                trace!("UDP {} -> {} ({} bytes)", client, target, plain.len() - used);
                (target, plain[used..].to_vec())
            }
        };

        self.ensure_session(registry, client, now)?;
        let bind_v6 = self.bind_v6;
        let queue_limit = self.queue_limit;
        let Some(session) = self.sessions.get_mut(&client) else {
            return Ok(());
        };
        session.last_activity = now;

        match target {
            Address::Socket(addr) => send_upstream(&session.socket, bind_v6, addr, &payload),
            Address::Domain(host, port) => match resolver.resolve(&host, Waiter::Udp(client), now) {
                Lookup::Ready(ip) => {
                    send_upstream(&session.socket, bind_v6, SocketAddr::new(ip, port), &payload)
                }
                Lookup::Pending => {
                    if session.queue.len() >= queue_limit {
                        session.queue.pop_front();
                        let e = Error::exhausted(format!("{} datagrams queued", queue_limit));
                        debug!("Dropped oldest datagram from {}: {}", client, e);
                    }
                    session.queue.push_back(Queued {
                        host,
                        port,
                        payload,
                    });
                }
                Lookup::Failed(e) => return Err(e),
            },
        }
        Ok(())
    }

    fn ensure_session(&mut self, registry: &mut Registry, client: SocketAddr, now: Instant) -> Result<()> {
        if self.sessions.contains(&client) {
            return Ok(());
        }

        let unspecified = if self.bind_v6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let mut socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
        let token = registry.register(&mut socket, Owner::Udp, Interest::READABLE)?;
        debug!("New UDP session for {} (token {})", client, token.0);

        self.routes.insert(token, client);
        self.sessions.put(
            client,
            UdpSession {
                socket,
                token,
                last_activity: now,
                queue: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn read_upstream(&mut self, client: SocketAddr, now: Instant) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(session) = self.sessions.get_mut(&client) else {
                return;
            };
            let (n, from) = match session.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("UDP session for {} receive failed: {}", client, e);
                    return;
                }
            };
            session.last_activity = now;

            let reply = match self.mode {
                Mode::Local => self.cryptor.decrypt_packet(&buf[..n]).and_then(|body| {
                    // The body must start with a well-formed address header.
                    Address::parse(&body)?
                        .ok_or_else(|| Error::protocol("UDP reply header truncated"))?;
                    Ok(socks5::udp_response(&body))
                }),
                Mode::Server => {
                    let source = Address::Socket(canonical(from));
                    let mut body = Vec::with_capacity(source.encoded_len() + n);
                    source
                        .write_to(&mut body)
                        .and_then(|()| {
                            body.extend_from_slice(&buf[..n]);
                            self.cryptor.encrypt_packet(&body)
                        })
                }
            };

            match reply {
                Ok(datagram) => {
                    if let Some(socket) = self.socket.as_ref() {
                        if let Err(e) = socket.send_to(&datagram, client) {
                            debug!("UDP send to client {} failed: {}", client, e);
                        }
                    }
                }
                Err(e) => debug!("Dropping UDP reply from {} for {}: {}", from, client, e),
            }
        }
    }

    #[cfg(test)]
    fn queued(&self, client: &SocketAddr) -> usize {
        self.sessions.peek(client).map_or(0, |s| s.queue.len())
    }
}

fn send_upstream(socket: &UdpSocket, bind_v6: bool, target: SocketAddr, payload: &[u8]) {
    let target = match target {
        SocketAddr::V4(v4) if bind_v6 => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        other => other,
    };
    if let Err(e) = socket.send_to(payload, target) {
        debug!("UDP send to {} failed: {}", target, e);
    }
}

/// Undo IPv4-mapped IPv6 addresses from dual-stack sockets.
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(IpAddr::V4(ip), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}
