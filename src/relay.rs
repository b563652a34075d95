//! Relay instance: one reactor driving the resolver and both relays.
//!
//! [`start`] binds everything in the caller's thread, so address and
//! configuration problems are reported synchronously, then hands the loop
//! to a dedicated thread. [`RelayHandle::stop`] closes the listeners, lets
//! TCP sessions drain for the grace period and joins the thread.

use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use mio::net::{TcpListener, UdpSocket};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{Mode, RelayConfig};
use crate::crypto::Cryptor;
use crate::dns::{DnsResolver, Waiter};
use crate::error::{Error, Result};
use crate::reactor::{EventHandler, Owner, Readiness, ReactorLoop, Registry, StopHandle, Token, DEFAULT_TICK};
use crate::tcprelay::TcpRelay;
use crate::udprelay::UdpRelay;

/// Everything one reactor dispatches to.
pub struct Relay {
    resolver: DnsResolver,
    tcp: TcpRelay,
    udp: Option<UdpRelay>,
}

impl Relay {
    pub fn new(resolver: DnsResolver, tcp: TcpRelay, udp: Option<UdpRelay>) -> Self {
        Self { resolver, tcp, udp }
    }

    pub fn register(&mut self, registry: &mut Registry) -> Result<()> {
        self.resolver.register(registry)?;
        self.tcp.register(registry)?;
        if let Some(udp) = self.udp.as_mut() {
            udp.register(registry)?;
        }
        Ok(())
    }

    /// Deliver finished lookups to their waiters.
    fn dispatch_resolutions(&mut self, registry: &mut Registry, now: Instant) {
        loop {
            let completed = self.resolver.take_completed();
            if completed.is_empty() {
                return;
            }
            for resolution in completed {
                for waiter in &resolution.waiters {
                    match *waiter {
                        Waiter::Tcp(key) => self.tcp.on_resolved(
                            registry,
                            &mut self.resolver,
                            key,
                            &resolution.result,
                            now,
                        ),
                        Waiter::Udp(client) => {
                            if let Some(udp) = self.udp.as_mut() {
                                udp.on_resolved(client, &resolution.hostname, &resolution.result, now);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl EventHandler for Relay {
    fn on_event(&mut self, registry: &mut Registry, token: Token, ready: Readiness, now: Instant) {
        match registry.owner(token) {
            Some(Owner::Dns) => self.resolver.on_event(registry, token, ready, now),
            Some(Owner::Tcp) => self.tcp.on_event(registry, &mut self.resolver, token, ready, now),
            Some(Owner::Udp) => {
                if let Some(udp) = self.udp.as_mut() {
                    udp.on_event(registry, &mut self.resolver, token, ready, now);
                }
            }
            None => return,
        }
        self.dispatch_resolutions(registry, now);
    }

    fn on_tick(&mut self, registry: &mut Registry, now: Instant) {
        self.resolver.on_tick(registry, now);
        self.dispatch_resolutions(registry, now);
        self.tcp.on_tick(registry, now);
        if let Some(udp) = self.udp.as_mut() {
            udp.on_tick(registry, now);
        }
    }

    fn on_stop(&mut self, registry: &mut Registry) {
        self.tcp.close_listener(registry);
        if let Some(udp) = self.udp.as_mut() {
            udp.close(registry);
        }
    }

    fn is_drained(&self) -> bool {
        self.tcp.session_count() == 0
    }

    fn on_shutdown(&mut self, registry: &mut Registry) {
        let remaining = self.tcp.session_count();
        if remaining > 0 {
            info!("Force-closing {} sessions", remaining);
        }
        self.tcp.close_listener(registry);
        self.tcp.close_all(registry);
        if let Some(udp) = self.udp.as_mut() {
            udp.close(registry);
        }
        self.resolver.deregister(registry);
    }
}

/// Handle to a running relay.
///
/// Dropping the handle stops the relay.
pub struct RelayHandle {
    stop: StopHandle,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
    local_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
}

impl RelayHandle {
    /// Bound TCP listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound UDP address, if the UDP relay is enabled.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Stop accepting, drain, and wait for the reactor thread.
    ///
    /// Returns the reactor's result the first time; later calls return
    /// `Ok(())`.
    pub fn stop(&self) -> Result<()> {
        self.stop.stop();
        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| Error::Reactor("reactor thread panicked".into()))?
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("Relay stopped with error: {}", e);
        }
    }
}

/// Validate `config`, bind its sockets and run the relay on its own thread.
pub fn start(config: RelayConfig) -> Result<RelayHandle> {
    config.validate()?;
    let cryptor = Cryptor::new(&config.method, &config.password)?;
    let listen = config.listen_addr()?;

    let mut reactor = ReactorLoop::new(DEFAULT_TICK, config.grace_period)?;
    let listener = TcpListener::bind(listen)?;
    let local_addr = listener.local_addr()?;

    let udp = if config.udp_enabled {
        let socket = UdpSocket::bind(local_addr)?;
        Some(UdpRelay::new(&config, cryptor.clone(), socket)?)
    } else {
        None
    };
    let udp_addr = udp.as_ref().and_then(UdpRelay::local_addr);

    let tcp = TcpRelay::new(&config, cryptor.clone(), listener, udp_addr);
    let resolver = DnsResolver::from_config(&config)?;
    let mut relay = Relay::new(resolver, tcp, udp);
    relay.register(reactor.registry())?;

    let mode = match config.mode {
        Mode::Local => "local",
        Mode::Server => "server",
    };
    info!(
        "Relay ({}) listening on {} using {}",
        mode,
        local_addr,
        cryptor.kind()
    );
    if let Some(addr) = udp_addr {
        info!("UDP relay on {}", addr);
    }

    let stop = reactor.stop_handle();
    let thread = thread::Builder::new()
        .name("ssrelay-reactor".into())
        .spawn(move || reactor.run(&mut relay))?;

    Ok(RelayHandle {
        stop,
        thread: Mutex::new(Some(thread)),
        local_addr,
        udp_addr,
    })
}

/// Stop a relay started with [`start`].
pub fn stop(handle: &RelayHandle) -> Result<()> {
    handle.stop()
}
