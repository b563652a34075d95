//! Per-connection state machine.
//!
//! ```text
//! INIT ─► ADDR ─┬─► DNS_RESOLVING ─► CONNECTING ─► STREAMING ─► CLOSING ─► CLOSED
//!               └──────────────────► CONNECTING
//! ```
//!
//! In local mode the client speaks SOCKS5 and the session starts in INIT;
//! client bytes are encrypted on the way upstream. In server mode the
//! client is a local relay, the session starts in ADDR by decrypting the
//! target header, and the directions are reversed.
//!
//! Every public entry point ends by flushing what can be flushed and
//! re-deriving both sockets' interest from the session state, so the
//! registration always reflects exactly what the session is waiting for.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::Mode;
use crate::crypto::{Cryptor, DecryptSession, EncryptSession};
use crate::dns::{DnsResolver, Lookup, Waiter};
use crate::error::{Error, Result};
use crate::reactor::{Interest, Owner, Readiness, Registry, Token};
use crate::socks5::{
    self, Address, Greeting, Reply, Request, CMD_CONNECT, CMD_UDP_ASSOCIATE, METHOD_NO_ACCEPTABLE,
    METHOD_NO_AUTH,
};

const BUF_SIZE: usize = 16 * 1024;

/// Session lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Awaiting the SOCKS5 greeting
    Init,
    /// Awaiting the target (SOCKS5 request or tunnel header)
    Addr,
    /// Waiting on the resolver for the upstream host
    DnsResolving,
    /// Non-blocking connect in progress
    Connecting,
    /// Relaying in both directions
    Streaming,
    /// SOCKS5 UDP ASSOCIATE control connection; input is discarded
    UdpAssociate,
    /// Flushing buffered output before closing
    Closing,
    /// Terminal
    Closed,
}

/// Settings shared by every session of one TCP relay.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub high_water: usize,
    pub low_water: usize,
    pub timeout: Duration,
    /// Remote relay server (local mode only)
    pub upstream: Option<Address>,
    /// Address reported to UDP ASSOCIATE requests, if UDP is enabled
    pub udp_addr: Option<SocketAddr>,
}

/// What a session needs from its manager for one call.
pub struct Context<'a> {
    pub registry: &'a mut Registry,
    pub resolver: &'a mut DnsResolver,
    pub settings: &'a Settings,
    pub now: Instant,
}

/// Read gate driven by the size of the buffer the reads feed into.
///
/// Pauses once the buffer grows above `high` and resumes only after it has
/// drained below `low`.
#[derive(Debug, Clone, Copy)]
pub struct Backpressure {
    high: usize,
    low: usize,
    paused: bool,
}

impl Backpressure {
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low,
            paused: false,
        }
    }

    /// Re-evaluate against the pending byte count; returns whether paused.
    pub fn update(&mut self, pending: usize) -> bool {
        if self.paused {
            if pending < self.low {
                self.paused = false;
            }
        } else if pending > self.high {
            self.paused = true;
        }
        self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

struct Endpoint {
    stream: TcpStream,
    token: Token,
}

/// One proxied TCP connection.
pub struct Session {
    stage: Stage,
    mode: Mode,
    client: Endpoint,
    upstream: Option<Endpoint>,
    upstream_token: Option<Token>,
    upstream_connected: bool,
    upstream_port: u16,
    encryptor: EncryptSession,
    decryptor: DecryptSession,
    /// Plaintext received before the target is known
    handshake: Vec<u8>,
    to_client: BytesMut,
    to_upstream: BytesMut,
    /// Gates client reads on `to_upstream`
    client_flow: Backpressure,
    /// Gates upstream reads on `to_client`
    upstream_flow: Backpressure,
    target: Option<Address>,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    /// Wrap an accepted, already registered client connection.
    pub fn new(
        stream: TcpStream,
        token: Token,
        cryptor: &Cryptor,
        settings: &Settings,
        now: Instant,
    ) -> Self {
        Self {
            stage: match settings.mode {
                Mode::Local => Stage::Init,
                Mode::Server => Stage::Addr,
            },
            mode: settings.mode,
            client: Endpoint { stream, token },
            upstream: None,
            upstream_token: None,
            upstream_connected: false,
            upstream_port: 0,
            encryptor: cryptor.new_encrypt_session(),
            decryptor: cryptor.new_decrypt_session(),
            handshake: Vec::new(),
            to_client: BytesMut::new(),
            to_upstream: BytesMut::new(),
            client_flow: Backpressure::new(settings.high_water, settings.low_water),
            upstream_flow: Backpressure::new(settings.high_water, settings.low_water),
            target: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_closed(&self) -> bool {
        self.stage == Stage::Closed
    }

    /// Token of the upstream socket, kept after close for route cleanup.
    pub fn upstream_token(&self) -> Option<Token> {
        self.upstream_token
    }

    pub fn target(&self) -> Option<&Address> {
        self.target.as_ref()
    }

    /// Bytes queued for the upstream socket.
    #[cfg(test)]
    pub(crate) fn pending_upstream(&self) -> usize {
        self.to_upstream.len()
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }

    pub fn on_client_ready(&mut self, cx: &mut Context<'_>, ready: Readiness) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if ready.readable || ready.error {
            self.read_client(cx)?;
        }
        self.pump(cx)
    }

    pub fn on_upstream_ready(&mut self, cx: &mut Context<'_>, ready: Readiness) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.stage == Stage::Connecting && (ready.writable || ready.error) {
            self.finish_connect()?;
        }
        if self.stage == Stage::Streaming && (ready.readable || ready.error) {
            self.read_upstream(cx)?;
        }
        self.pump(cx)
    }

    /// Resolution of the upstream host finished.
    pub fn on_resolved(&mut self, cx: &mut Context<'_>, result: &Result<IpAddr>) -> Result<()> {
        if self.stage != Stage::DnsResolving {
            return Ok(());
        }
        match result {
            Ok(ip) => self.connect(cx, SocketAddr::new(*ip, self.upstream_port))?,
            Err(e) => {
                self.reply_failure(Reply::HostUnreachable);
                return Err(Error::dns(e.to_string()));
            }
        }
        self.pump(cx)
    }

    /// Unregister and close both sockets. A second call is a no-op.
    pub fn close(&mut self, registry: &mut Registry) {
        if self.stage == Stage::Closed {
            return;
        }

        // Best effort: whatever the kernel accepts right now.
        let _ = flush(&mut self.client.stream, &mut self.to_client);
        if let Some(up) = self.upstream.as_mut() {
            if self.upstream_connected {
                let _ = flush(&mut up.stream, &mut self.to_upstream);
            }
        }

        if let Err(e) = registry.unregister(&mut self.client.stream, self.client.token) {
            debug!("Unregister client {} failed: {}", self.client.token.0, e);
        }
        let _ = self.client.stream.shutdown(Shutdown::Both);

        if let Some(mut up) = self.upstream.take() {
            if let Err(e) = registry.unregister(&mut up.stream, up.token) {
                debug!("Unregister upstream {} failed: {}", up.token.0, e);
            }
            let _ = up.stream.shutdown(Shutdown::Both);
        }

        self.to_client.clear();
        self.to_upstream.clear();
        self.stage = Stage::Closed;
        debug!(
            "Session {} closed after {:?}",
            self.client.token.0,
            self.last_activity.duration_since(self.created_at)
        );
    }

    fn read_client(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            if !self.reads_client() || self.client_flow.update(self.to_upstream.len()) {
                return Ok(());
            }
            match self.client.stream.read(&mut buf) {
                Ok(0) => {
                    trace!("Client {} sent EOF", self.client.token.0);
                    self.stage = Stage::Closing;
                    return Ok(());
                }
                Ok(n) => {
                    self.last_activity = cx.now;
                    self.on_client_data(cx, &buf[..n])?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_upstream(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            if self.stage != Stage::Streaming || self.upstream_flow.update(self.to_client.len()) {
                return Ok(());
            }
            let Some(up) = self.upstream.as_mut() else {
                return Ok(());
            };
            match up.stream.read(&mut buf) {
                Ok(0) => {
                    trace!("Upstream of {} sent EOF", self.client.token.0);
                    self.stage = Stage::Closing;
                    return Ok(());
                }
                Ok(n) => {
                    self.last_activity = cx.now;
                    let out = self.upstream_to_client(&buf[..n])?;
                    self.to_client.extend_from_slice(&out);
                    flush(&mut self.client.stream, &mut self.to_client)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reads_client(&self) -> bool {
        matches!(
            self.stage,
            Stage::Init
                | Stage::Addr
                | Stage::DnsResolving
                | Stage::Connecting
                | Stage::Streaming
                | Stage::UdpAssociate
        )
    }

    fn on_client_data(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Result<()> {
        match self.stage {
            Stage::Init | Stage::Addr => match self.mode {
                Mode::Local => {
                    self.handshake.extend_from_slice(data);
                    self.advance_socks(cx)
                }
                Mode::Server => {
                    let plain = self.decryptor.decrypt(data)?;
                    self.handshake.extend_from_slice(&plain);
                    self.advance_header(cx)
                }
            },
            Stage::DnsResolving | Stage::Connecting | Stage::Streaming => {
                let out = self.client_to_upstream(data)?;
                self.to_upstream.extend_from_slice(&out);
                if self.upstream_connected {
                    if let Some(up) = self.upstream.as_mut() {
                        flush(&mut up.stream, &mut self.to_upstream)?;
                    }
                }
                Ok(())
            }
            Stage::UdpAssociate | Stage::Closing | Stage::Closed => Ok(()),
        }
    }

    /// Local mode: greeting, then request.
    fn advance_socks(&mut self, cx: &mut Context<'_>) -> Result<()> {
        if self.stage == Stage::Init {
            let Some((greeting, used)) = Greeting::parse(&self.handshake)? else {
                return Ok(());
            };
            self.handshake.drain(..used);
            if !greeting.accepts_no_auth() {
                self.to_client
                    .extend_from_slice(&socks5::method_reply(METHOD_NO_ACCEPTABLE));
                return Err(Error::protocol("client offers no acceptable auth method"));
            }
            self.to_client
                .extend_from_slice(&socks5::method_reply(METHOD_NO_AUTH));
            self.stage = Stage::Addr;
        }

        let parsed = match Request::parse(&self.handshake) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reply_failure(socks5::request_error_reply(&self.handshake));
                return Err(e);
            }
        };
        let Some((request, used)) = parsed else {
            return Ok(());
        };
        let early = self.handshake.split_off(used);
        self.handshake.clear();

        match request.command {
            CMD_CONNECT => {
                debug!("Session {} CONNECT {}", self.client.token.0, request.target);
                let mut header = request.target.to_bytes()?;
                header.extend_from_slice(&early);
                let sealed = self.encryptor.encrypt(&header)?;
                self.to_upstream.extend_from_slice(&sealed);
                self.target = Some(request.target);

                let upstream = cx
                    .settings
                    .upstream
                    .clone()
                    .ok_or_else(|| Error::config("local mode without a remote server"))?;
                self.start_upstream(cx, &upstream)
            }
            CMD_UDP_ASSOCIATE if cx.settings.udp_addr.is_some() => {
                debug!("Session {} UDP ASSOCIATE", self.client.token.0);
                self.to_client
                    .extend_from_slice(&socks5::reply(Reply::Succeeded, cx.settings.udp_addr));
                self.stage = Stage::UdpAssociate;
                Ok(())
            }
            other => {
                self.reply_failure(Reply::CommandNotSupported);
                Err(Error::protocol(format!("unsupported SOCKS5 command {}", other)))
            }
        }
    }

    /// Server mode: decrypted target header.
    fn advance_header(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let Some((target, used)) = Address::parse(&self.handshake)? else {
            return Ok(());
        };
        let early = self.handshake.split_off(used);
        self.handshake.clear();
        self.to_upstream.extend_from_slice(&early);

        debug!("Session {} tunnel to {}", self.client.token.0, target);
        self.target = Some(target.clone());
        self.start_upstream(cx, &target)
    }

    fn start_upstream(&mut self, cx: &mut Context<'_>, upstream: &Address) -> Result<()> {
        match upstream {
            Address::Socket(addr) => self.connect(cx, *addr),
            Address::Domain(host, port) => {
                self.upstream_port = *port;
                match cx
                    .resolver
                    .resolve(host, Waiter::Tcp(self.client.token), cx.now)
                {
                    Lookup::Ready(ip) => self.connect(cx, SocketAddr::new(ip, *port)),
                    Lookup::Pending => {
                        self.stage = Stage::DnsResolving;
                        Ok(())
                    }
                    Lookup::Failed(e) => {
                        self.reply_failure(Reply::HostUnreachable);
                        Err(e)
                    }
                }
            }
        }
    }

    fn connect(&mut self, cx: &mut Context<'_>, addr: SocketAddr) -> Result<()> {
        trace!("Session {} connecting to {}", self.client.token.0, addr);
        let mut stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                self.reply_failure(reply_for(&e));
                return Err(e.into());
            }
        };
        let token = cx
            .registry
            .register(&mut stream, Owner::Tcp, Interest::WRITABLE)?;

        self.upstream = Some(Endpoint { stream, token });
        self.upstream_token = Some(token);
        self.stage = Stage::Connecting;
        Ok(())
    }

    fn finish_connect(&mut self) -> Result<()> {
        let Some(up) = self.upstream.as_mut() else {
            return Ok(());
        };

        let failure = match up.stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => match up.stream.peer_addr() {
                Ok(_) => None,
                // Spurious wakeup, still connecting.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => Some(e),
            },
        };
        if let Some(e) = failure {
            self.reply_failure(reply_for(&e));
            return Err(e.into());
        }

        let _ = up.stream.set_nodelay(true);
        self.upstream_connected = true;
        self.stage = Stage::Streaming;
        debug!("Session {} streaming", self.client.token.0);

        if self.mode == Mode::Local {
            self.to_client
                .extend_from_slice(&socks5::reply(Reply::Succeeded, None));
        }
        Ok(())
    }

    /// Queue a SOCKS5 failure reply (local mode only).
    fn reply_failure(&mut self, status: Reply) {
        if self.mode == Mode::Local && matches!(self.stage, Stage::Addr | Stage::DnsResolving | Stage::Connecting) {
            self.to_client
                .extend_from_slice(&socks5::reply(status, None));
        }
    }

    fn client_to_upstream(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            Mode::Local => self.encryptor.encrypt(data),
            Mode::Server => self.decryptor.decrypt(data),
        }
    }

    fn upstream_to_client(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            Mode::Local => self.decryptor.decrypt(data),
            Mode::Server => self.encryptor.encrypt(data),
        }
    }

    /// Flush, finish closing if drained, then re-derive interest.
    fn pump(&mut self, cx: &mut Context<'_>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let mut written = flush(&mut self.client.stream, &mut self.to_client)?;
        if self.upstream_connected {
            if let Some(up) = self.upstream.as_mut() {
                written += flush(&mut up.stream, &mut self.to_upstream)?;
            }
        }
        if written > 0 {
            self.last_activity = cx.now;
        }

        if self.stage == Stage::Closing {
            let upstream_drained = !self.upstream_connected || self.to_upstream.is_empty();
            if self.to_client.is_empty() && upstream_drained {
                self.close(cx.registry);
                return Ok(());
            }
        }

        self.sync_interest(cx.registry)
    }

    fn sync_interest(&mut self, registry: &mut Registry) -> Result<()> {
        let client_was_paused = self.client_flow.is_paused();
        let upstream_was_paused = self.upstream_flow.is_paused();
        let client_paused = self.client_flow.update(self.to_upstream.len());
        let upstream_paused = self.upstream_flow.update(self.to_client.len());

        if client_paused != client_was_paused {
            debug!(
                "Session {} client reads {} ({} bytes pending upstream)",
                self.client.token.0,
                if client_paused { "paused" } else { "resumed" },
                self.to_upstream.len()
            );
        }
        if upstream_paused != upstream_was_paused {
            debug!(
                "Session {} upstream reads {} ({} bytes pending to client)",
                self.client.token.0,
                if upstream_paused { "paused" } else { "resumed" },
                self.to_client.len()
            );
        }

        let client_interest = interest(
            self.reads_client() && !client_paused,
            !self.to_client.is_empty(),
        );
        registry.modify(&mut self.client.stream, self.client.token, client_interest)?;

        if let Some(up) = self.upstream.as_mut() {
            let reading = self.stage == Stage::Streaming && !upstream_paused;
            let writing = self.stage == Stage::Connecting
                || (self.upstream_connected && !self.to_upstream.is_empty());
            registry.modify(&mut up.stream, up.token, interest(reading, writing))?;
        }
        Ok(())
    }
}

fn interest(readable: bool, writable: bool) -> Option<Interest> {
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Write as much of `pending` as the socket accepts; returns bytes written.
fn flush(stream: &mut TcpStream, pending: &mut BytesMut) -> io::Result<usize> {
    let mut total = 0;
    while !pending.is_empty() {
        match stream.write(pending) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                pending.advance(n);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn reply_for(e: &io::Error) -> Reply {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
        _ => Reply::HostUnreachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::HostsFile;
    use crate::reactor::{ReactorLoop, DEFAULT_TICK};
    use std::net::TcpListener;

    fn settings(mode: Mode) -> Settings {
        Settings {
            mode,
            high_water: 1024,
            low_water: 256,
            timeout: Duration::from_secs(30),
            upstream: Some(Address::Socket("127.0.0.1:9".parse().unwrap())),
            udp_addr: None,
        }
    }

    #[test]
    fn test_backpressure_hysteresis() {
        let mut flow = Backpressure::new(1024, 256);
        assert!(!flow.update(1024));
        assert!(flow.update(1025));
        // Still paused between the marks.
        assert!(flow.update(600));
        assert!(flow.update(256));
        assert!(!flow.update(255));
        assert!(!flow.update(900));
    }

    #[test]
    fn test_interest_mapping() {
        assert_eq!(interest(false, false), None);
        assert_eq!(interest(true, false), Some(Interest::READABLE));
        assert_eq!(
            interest(true, true),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut reactor = ReactorLoop::new(DEFAULT_TICK, Duration::from_secs(1)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let token = reactor
            .registry()
            .register(&mut stream, Owner::Tcp, Interest::READABLE)
            .unwrap();
        let cryptor = Cryptor::new("aes-128-gcm", "pw").unwrap();
        let mut session = Session::new(
            stream,
            token,
            &cryptor,
            &settings(Mode::Local),
            Instant::now(),
        );
        assert_eq!(session.stage(), Stage::Init);

        session.close(reactor.registry());
        assert!(session.is_closed());
        assert!(reactor.registry().is_empty());

        session.close(reactor.registry());
        assert!(session.is_closed());
        assert!(reactor.registry().is_empty());
    }

    #[test]
    fn test_server_mode_starts_at_addr() {
        let mut reactor = ReactorLoop::new(DEFAULT_TICK, Duration::from_secs(1)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let token = reactor
            .registry()
            .register(&mut stream, Owner::Tcp, Interest::READABLE)
            .unwrap();
        let cryptor = Cryptor::new("aes-256-cfb", "pw").unwrap();
        let now = Instant::now();
        let session = Session::new(stream, token, &cryptor, &settings(Mode::Server), now);

        assert_eq!(session.stage(), Stage::Addr);
        assert!(!session.is_expired(now + Duration::from_secs(30), Duration::from_secs(30)));
        assert!(session.is_expired(now + Duration::from_secs(31), Duration::from_secs(30)));
    }

    #[test]
    fn test_handshake_reaches_resolution_for_domain() {
        use std::io::Write as _;

        let mut reactor = ReactorLoop::new(DEFAULT_TICK, Duration::from_secs(1)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut client, _) = listener.accept().unwrap();
        let token = reactor
            .registry()
            .register(&mut stream, Owner::Tcp, Interest::READABLE)
            .unwrap();

        // Server mode: the remote side resolves the tunnel target itself.
        let cryptor = Cryptor::new("chacha20-ietf-poly1305", "pw").unwrap();
        let settings = settings(Mode::Server);
        let mut resolver =
            DnsResolver::new(vec!["127.0.0.1:9".parse().unwrap()], HostsFile::new()).unwrap();
        let mut session = Session::new(stream, token, &cryptor, &settings, Instant::now());

        let target = Address::Domain("example.com".into(), 80);
        let header = cryptor
            .new_encrypt_session()
            .encrypt(&target.to_bytes().unwrap())
            .unwrap();
        client.write_all(&header).unwrap();

        let mut cx = Context {
            registry: reactor.registry(),
            resolver: &mut resolver,
            settings: &settings,
            now: Instant::now(),
        };
        for _ in 0..100 {
            session.on_client_ready(&mut cx, Readiness::READABLE).unwrap();
            if session.stage() != Stage::Addr {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(session.stage(), Stage::DnsResolving);
        assert_eq!(session.target(), Some(&target));
        assert_eq!(resolver.pending_count(), 1);
    }
}
