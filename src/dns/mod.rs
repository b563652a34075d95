//! Non-blocking DNS resolver driven by the reactor.
//!
//! Queries go out over UDP to the configured servers, round-robin per
//! lookup. Replies are matched to pending lookups by query id. A lookup
//! that times out is resent, up to `retries` times per server, before the
//! next server is tried; once every server has been exhausted the lookup
//! fails. Truncated replies are re-asked over TCP.
//!
//! Concurrent lookups of one name share a single pending query. Results are
//! not delivered through callbacks: they are queued as [`Resolution`]s and
//! collected by the owner with [`DnsResolver::take_completed`].

mod cache;
mod hosts;

pub use cache::{DnsCache, MAX_TTL, MIN_TTL};
pub use hosts::{load_resolv_conf, parse_resolv_conf, HostsFile};

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use mio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::reactor::{Interest, Owner, Readiness, Registry, Token};

/// Servers used when neither configuration nor resolv.conf name any.
pub const FALLBACK_SERVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
];

const MAX_MESSAGE_SIZE: usize = 4096;

/// Who is waiting on a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waiter {
    /// TCP session, identified by its client socket token
    Tcp(Token),
    /// UDP session, identified by its client endpoint
    Udp(SocketAddr),
}

/// Immediate outcome of [`DnsResolver::resolve`].
#[derive(Debug)]
pub enum Lookup {
    /// Answered without network traffic
    Ready(IpAddr),
    /// Query in flight; a [`Resolution`] will follow
    Pending,
    /// Rejected without network traffic
    Failed(Error),
}

/// A finished lookup and everyone who was waiting on it.
#[derive(Debug)]
pub struct Resolution {
    pub hostname: String,
    pub waiters: Vec<Waiter>,
    pub result: Result<IpAddr>,
}

struct PendingQuery {
    waiters: Vec<Waiter>,
    qtype: RecordType,
    fallback_tried: bool,
    id: u16,
    server: usize,
    servers_tried: usize,
    attempts: u32,
    sent_at: Instant,
    tcp: Option<Token>,
}

struct TcpQuery {
    hostname: String,
    stream: TcpStream,
    out: Vec<u8>,
    written: usize,
    inbuf: Vec<u8>,
}

impl TcpQuery {
    /// Push the framed query out and collect the framed reply.
    fn advance(&mut self, ready: Readiness) -> io::Result<Option<Vec<u8>>> {
        if ready.error {
            if let Some(e) = self.stream.take_error()? {
                return Err(e);
            }
        }

        while self.written < self.out.len() {
            match self.stream.write(&self.out[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.written += n,
                Err(e) if is_not_ready(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.inbuf.extend_from_slice(&buf[..n]);
                    if self.inbuf.len() >= 2 {
                        let len = u16::from_be_bytes([self.inbuf[0], self.inbuf[1]]) as usize;
                        if self.inbuf.len() >= 2 + len {
                            return Ok(Some(self.inbuf[2..2 + len].to_vec()));
                        }
                    }
                }
                Err(e) if is_not_ready(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_not_ready(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected
    )
}

struct QuerySocket {
    socket: UdpSocket,
    token: Option<Token>,
}

impl QuerySocket {
    fn bind(unspecified: IpAddr) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(SocketAddr::new(unspecified, 0))?,
            token: None,
        })
    }
}

/// Asynchronous resolver with cache and request coalescing.
pub struct DnsResolver {
    servers: Vec<SocketAddr>,
    next_server: usize,
    hosts: HostsFile,
    cache: DnsCache,
    udp4: Option<QuerySocket>,
    udp6: Option<QuerySocket>,
    pending: HashMap<String, PendingQuery>,
    by_id: HashMap<u16, String>,
    tcp_queries: HashMap<Token, TcpQuery>,
    completed: Vec<Resolution>,
    timeout: Duration,
    retries: u32,
    prefer_ipv6: bool,
}

impl DnsResolver {
    /// Create a resolver querying `servers` (must not be empty).
    pub fn new(servers: Vec<SocketAddr>, hosts: HostsFile) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::config("no DNS servers configured"));
        }

        let udp4 = if servers.iter().any(|s| s.is_ipv4()) {
            Some(QuerySocket::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED))?)
        } else {
            None
        };
        let udp6 = if servers.iter().any(|s| s.is_ipv6()) {
            Some(QuerySocket::bind(IpAddr::V6(Ipv6Addr::UNSPECIFIED))?)
        } else {
            None
        };

        Ok(Self {
            servers,
            next_server: 0,
            hosts,
            cache: DnsCache::default(),
            udp4,
            udp6,
            pending: HashMap::new(),
            by_id: HashMap::new(),
            tcp_queries: HashMap::new(),
            completed: Vec::new(),
            timeout: Duration::from_secs(2),
            retries: 2,
            prefer_ipv6: false,
        })
    }

    /// Build a resolver from relay configuration.
    ///
    /// Servers come from the configuration, else resolv.conf, else the
    /// public fallbacks.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let mut servers = config.dns_servers.clone();
        if servers.is_empty() {
            if let Some(path) = &config.resolv_conf_path {
                servers = load_resolv_conf(path);
            }
        }
        if servers.is_empty() {
            servers = FALLBACK_SERVERS
                .iter()
                .map(|ip| SocketAddr::new(*ip, 53))
                .collect();
        }

        let hosts = config
            .hosts_path
            .as_deref()
            .map(HostsFile::load)
            .unwrap_or_default();

        debug!("DNS servers: {:?}", servers);
        Ok(Self::new(servers, hosts)?
            .with_timeout(config.dns_timeout, config.dns_retries)
            .prefer_ipv6(config.prefer_ipv6))
    }

    /// Per-attempt timeout and number of attempts per server.
    pub fn with_timeout(mut self, timeout: Duration, retries: u32) -> Self {
        self.timeout = timeout;
        self.retries = retries.max(1);
        self
    }

    pub fn prefer_ipv6(mut self, prefer: bool) -> Self {
        self.prefer_ipv6 = prefer;
        self
    }

    /// Register the query sockets with the reactor.
    pub fn register(&mut self, registry: &mut Registry) -> Result<()> {
        for sock in [self.udp4.as_mut(), self.udp6.as_mut()].into_iter().flatten() {
            sock.token = Some(registry.register(&mut sock.socket, Owner::Dns, Interest::READABLE)?);
        }
        Ok(())
    }

    /// Release every socket; pending lookups are dropped without completion.
    pub fn deregister(&mut self, registry: &mut Registry) {
        for sock in [self.udp4.as_mut(), self.udp6.as_mut()].into_iter().flatten() {
            if let Some(token) = sock.token.take() {
                let _ = registry.unregister(&mut sock.socket, token);
            }
        }
        let tokens: Vec<Token> = self.tcp_queries.keys().copied().collect();
        for token in tokens {
            self.close_tcp(registry, token);
        }
        self.pending.clear();
        self.by_id.clear();
    }

    /// Resolve `hostname` on behalf of `waiter`.
    pub fn resolve(&mut self, hostname: &str, waiter: Waiter, now: Instant) -> Lookup {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Lookup::Ready(ip);
        }

        let name = hostname.trim_end_matches('.').to_ascii_lowercase();
        if let Some(ip) = self.hosts.lookup(&name, self.prefer_ipv6) {
            trace!("{} answered from hosts file", name);
            return Lookup::Ready(ip);
        }
        if let Some(ip) = self.cache.get(&name, now) {
            return Lookup::Ready(ip);
        }
        if !is_valid_hostname(&name) {
            return Lookup::Failed(Error::dns(format!("invalid hostname: {:?}", hostname)));
        }

        if let Some(query) = self.pending.get_mut(&name) {
            if !query.waiters.contains(&waiter) {
                query.waiters.push(waiter);
            }
            trace!("Joined in-flight lookup for {}", name);
            return Lookup::Pending;
        }

        let server = self.next_server;
        self.next_server = (self.next_server + 1) % self.servers.len();
        self.pending.insert(
            name.clone(),
            PendingQuery {
                waiters: vec![waiter],
                qtype: if self.prefer_ipv6 {
                    RecordType::AAAA
                } else {
                    RecordType::A
                },
                fallback_tried: false,
                id: 0,
                server,
                servers_tried: 0,
                attempts: 0,
                sent_at: now,
                tcp: None,
            },
        );

        match self.send_query(&name, now) {
            Ok(()) => Lookup::Pending,
            Err(e) => {
                if let Some(query) = self.pending.remove(&name) {
                    self.by_id.remove(&query.id);
                }
                Lookup::Failed(e)
            }
        }
    }

    /// Handle readiness on one of the resolver's sockets.
    pub fn on_event(&mut self, registry: &mut Registry, token: Token, ready: Readiness, now: Instant) {
        if self.udp4.as_ref().and_then(|s| s.token) == Some(token) {
            self.read_udp(registry, false, now);
        } else if self.udp6.as_ref().and_then(|s| s.token) == Some(token) {
            self.read_udp(registry, true, now);
        } else {
            self.on_tcp_event(registry, token, ready, now);
        }
    }

    /// Retry or fail timed-out lookups and purge expired cache entries.
    pub fn on_tick(&mut self, registry: &mut Registry, now: Instant) {
        let purged = self.cache.purge_expired(now);
        if purged > 0 {
            trace!("Purged {} expired DNS cache entries", purged);
        }

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, q)| now.duration_since(q.sent_at) >= self.timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            self.retry(registry, &name, now);
        }
    }

    /// Drain finished lookups.
    pub fn take_completed(&mut self) -> Vec<Resolution> {
        std::mem::take(&mut self.completed)
    }

    /// Number of lookups currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    fn send_query(&mut self, name: &str, now: Instant) -> Result<()> {
        let Some(query) = self.pending.get_mut(name) else {
            return Ok(());
        };

        self.by_id.remove(&query.id);
        let id = loop {
            let id = SecureRandom::u16();
            if !self.by_id.contains_key(&id) {
                break id;
            }
        };
        query.id = id;
        query.sent_at = now;
        query.attempts += 1;
        self.by_id.insert(id, name.to_string());

        let packet = build_query(name, query.qtype, id)?;
        let server = self.servers[query.server];
        let sock = if server.is_ipv4() {
            self.udp4.as_ref()
        } else {
            self.udp6.as_ref()
        };

        debug!("DNS query {:?} {} via {} (id {})", query.qtype, name, server, id);
        if let Some(sock) = sock {
            // A failed send is retried by the timeout sweep.
            if let Err(e) = sock.socket.send_to(&packet, server) {
                debug!("DNS send to {} failed: {}", server, e);
            }
        }
        Ok(())
    }

    fn retry(&mut self, registry: &mut Registry, name: &str, now: Instant) {
        let server_count = self.servers.len();
        let Some(query) = self.pending.get_mut(name) else {
            return;
        };
        let stale_tcp = query.tcp.take();

        if query.attempts >= self.retries {
            query.server = (query.server + 1) % server_count;
            query.servers_tried += 1;
            query.attempts = 0;
        }
        let exhausted = query.servers_tried >= server_count;

        if let Some(token) = stale_tcp {
            self.close_tcp(registry, token);
        }

        if exhausted {
            self.complete(registry, name, Err(Error::dns(format!("lookup of {} timed out", name))));
            return;
        }
        if let Err(e) = self.send_query(name, now) {
            self.complete(registry, name, Err(e));
        }
    }

    fn read_udp(&mut self, registry: &mut Registry, v6: bool, now: Instant) {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let sock = if v6 { &self.udp6 } else { &self.udp4 };
            let Some(sock) = sock else {
                return;
            };

            match sock.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if !self.servers.contains(&from) {
                        trace!("Ignoring DNS reply from unknown server {}", from);
                        continue;
                    }
                    self.handle_reply(registry, &buf[..n], from, now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("DNS socket error: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_reply(&mut self, registry: &mut Registry, data: &[u8], server: SocketAddr, now: Instant) {
        let message = match Message::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                debug!("Malformed DNS reply from {}: {}", server, e);
                return;
            }
        };
        if message.message_type() != MessageType::Response {
            return;
        }

        let Some(name) = self.by_id.get(&message.id()).cloned() else {
            trace!("DNS reply with unknown id {}", message.id());
            return;
        };
        if let Some(question) = message.queries().first() {
            if !question
                .name()
                .to_ascii()
                .trim_end_matches('.')
                .eq_ignore_ascii_case(&name)
            {
                return;
            }
        }

        if message.truncated() {
            self.escalate_tcp(registry, &name, server, now);
            return;
        }

        self.by_id.remove(&message.id());
        self.handle_answer(registry, &name, &message, now);
    }

    fn handle_answer(&mut self, registry: &mut Registry, name: &str, message: &Message, now: Instant) {
        let Some(query) = self.pending.get_mut(name) else {
            return;
        };

        if let Some((ip, ttl)) = extract_address(message, query.qtype) {
            self.cache.insert(name, ip, ttl, now);
            self.complete(registry, name, Ok(ip));
            return;
        }

        if !query.fallback_tried {
            query.fallback_tried = true;
            query.qtype = match query.qtype {
                RecordType::AAAA => RecordType::A,
                _ => RecordType::AAAA,
            };
            query.attempts = 0;
            if let Err(e) = self.send_query(name, now) {
                self.complete(registry, name, Err(e));
            }
            return;
        }

        let code = message.response_code();
        self.complete(
            registry,
            name,
            Err(Error::dns(format!("no address for {} ({:?})", name, code))),
        );
    }

    fn escalate_tcp(&mut self, registry: &mut Registry, name: &str, server: SocketAddr, now: Instant) {
        let Some(query) = self.pending.get_mut(name) else {
            return;
        };
        if query.tcp.is_some() {
            return;
        }
        self.by_id.remove(&query.id);

        let packet = match build_query(name, query.qtype, query.id) {
            Ok(p) => p,
            Err(e) => {
                self.complete(registry, name, Err(e));
                return;
            }
        };
        let mut framed = (packet.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&packet);

        // Connect or register failures are left to the timeout sweep.
        let mut stream = match TcpStream::connect(server) {
            Ok(s) => s,
            Err(e) => {
                debug!("DNS TCP connect to {} failed: {}", server, e);
                return;
            }
        };
        let token = match registry.register(
            &mut stream,
            Owner::Dns,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            Ok(t) => t,
            Err(e) => {
                debug!("DNS TCP register failed: {}", e);
                return;
            }
        };

        debug!("DNS reply for {} truncated, retrying over TCP", name);
        query.tcp = Some(token);
        query.sent_at = now;
        self.tcp_queries.insert(
            token,
            TcpQuery {
                hostname: name.to_string(),
                stream,
                out: framed,
                written: 0,
                inbuf: Vec::new(),
            },
        );
    }

    fn on_tcp_event(&mut self, registry: &mut Registry, token: Token, ready: Readiness, now: Instant) {
        let outcome = match self.tcp_queries.get_mut(&token) {
            Some(tq) => tq.advance(ready),
            None => return,
        };

        match outcome {
            Ok(None) => {}
            Ok(Some(reply)) => {
                let Some(name) = self.close_tcp(registry, token) else {
                    return;
                };
                let message = match Message::from_bytes(&reply) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Malformed DNS TCP reply for {}: {}", name, e);
                        return;
                    }
                };
                let expected = self.pending.get(&name).map(|q| q.id);
                if expected == Some(message.id()) {
                    self.handle_answer(registry, &name, &message, now);
                }
            }
            Err(e) => {
                if let Some(name) = self.close_tcp(registry, token) {
                    debug!("DNS TCP query for {} failed: {}", name, e);
                }
            }
        }
    }

    /// Close a TCP query, returning the hostname it served.
    fn close_tcp(&mut self, registry: &mut Registry, token: Token) -> Option<String> {
        let mut tq = self.tcp_queries.remove(&token)?;
        let _ = registry.unregister(&mut tq.stream, token);
        if let Some(query) = self.pending.get_mut(&tq.hostname) {
            if query.tcp == Some(token) {
                query.tcp = None;
            }
        }
        Some(tq.hostname)
    }

    fn complete(&mut self, registry: &mut Registry, name: &str, result: Result<IpAddr>) {
        let Some(query) = self.pending.remove(name) else {
            return;
        };
        self.by_id.remove(&query.id);
        if let Some(token) = query.tcp {
            self.close_tcp(registry, token);
        }

        match &result {
            Ok(ip) => debug!("Resolved {} to {}", name, ip),
            Err(e) => debug!("Failed to resolve {}: {}", name, e),
        }
        self.completed.push(Resolution {
            hostname: name.to_string(),
            waiters: query.waiters,
            result,
        });
    }
}

fn build_query(name: &str, qtype: RecordType, id: u16) -> Result<Vec<u8>> {
    let name = Name::from_ascii(name).map_err(|e| Error::dns(format!("invalid name: {}", e)))?;

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, qtype));

    message
        .to_bytes()
        .map_err(|e| Error::dns(format!("failed to encode query: {}", e)))
}

/// First address of the queried type and the smallest TTL among them.
fn extract_address(message: &Message, qtype: RecordType) -> Option<(IpAddr, u32)> {
    let mut found: Option<IpAddr> = None;
    let mut ttl = u32::MAX;

    for answer in message.answers() {
        let ip = match (answer.data(), qtype) {
            (RData::A(a), RecordType::A) => IpAddr::V4(a.0),
            (RData::AAAA(aaaa), RecordType::AAAA) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        ttl = ttl.min(answer.ttl());
        found.get_or_insert(ip);
    }

    found.map(|ip| (ip, ttl))
}

/// Hostname syntax check: at most 255 bytes, labels of 1 to 63 characters
/// from `[A-Za-z0-9-_]`.
pub fn is_valid_hostname(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}
