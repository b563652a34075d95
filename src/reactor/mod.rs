//! Single-threaded readiness loop.
//!
//! The loop waits on the OS multiplexer (epoll, kqueue or IOCP through
//! `mio`), hands each readiness event to an [`EventHandler`], and fires a
//! periodic tick that drives every timeout sweep. Handlers run to
//! completion and must never block.
//!
//! ```text
//!  poll ──► on_event(token) ──► on_event(token) ... ──► on_tick (every `tick`)
//!   ▲                                                       │
//!   └───────────────────────────────────────────────────────┘
//! ```

mod registry;

pub use mio::{Interest, Token};
pub use registry::{Owner, Registry};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Poll, Waker};

use crate::error::{Error, Result};
use registry::WAKE_TOKEN;

/// Default interval between ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

const EVENT_CAPACITY: usize = 1024;

/// Readiness reported for one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error condition or peer hang-up
    pub error: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
    };

    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
    };
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            // Hang-ups are surfaced as readable so the owner reads the EOF.
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

/// Callbacks driven by the loop.
pub trait EventHandler {
    /// A registered socket became ready.
    fn on_event(&mut self, registry: &mut Registry, token: Token, ready: Readiness, now: Instant);

    /// Periodic tick, independent of socket readiness.
    fn on_tick(&mut self, registry: &mut Registry, now: Instant);

    /// Stop was requested: stop accepting new work.
    fn on_stop(&mut self, _registry: &mut Registry) {}

    /// True once nothing is left in flight after `on_stop`.
    fn is_drained(&self) -> bool {
        true
    }

    /// Grace period expired: close everything still open.
    fn on_shutdown(&mut self, _registry: &mut Registry) {}
}

/// Cloneable, thread-safe handle that asks a running loop to stop.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Request a stop and wake the loop. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.waker.wake() {
                tracing::warn!("Failed to wake reactor: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// The event loop.
pub struct ReactorLoop {
    poll: Poll,
    events: Events,
    registry: Registry,
    stop: StopHandle,
    tick: Duration,
    grace: Duration,
}

impl ReactorLoop {
    /// Create a loop ticking every `tick`, draining for at most `grace` on stop.
    pub fn new(tick: Duration, grace: Duration) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::Reactor(format!("poll: {}", e)))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| Error::Reactor(format!("waker: {}", e)))?;
        let registry = Registry::new(
            poll.registry()
                .try_clone()
                .map_err(|e| Error::Reactor(format!("registry: {}", e)))?,
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            registry,
            stop: StopHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            tick,
            grace,
        })
    }

    pub fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait up to `timeout` for readiness and dispatch every event.
    ///
    /// Returns the number of events dispatched. An interrupted wait counts
    /// as zero events; any other multiplexer failure is fatal.
    pub fn poll_once<H: EventHandler>(&mut self, handler: &mut H, timeout: Duration) -> Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Reactor(e.to_string()));
        }

        let now = Instant::now();
        let mut dispatched = 0;
        for event in self.events.iter() {
            let token = event.token();
            // Skip the waker and anything closed earlier in this batch.
            if token == WAKE_TOKEN || !self.registry.contains(token) {
                continue;
            }
            handler.on_event(&mut self.registry, token, Readiness::from(event), now);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Run until stopped and drained, or until the multiplexer fails.
    pub fn run<H: EventHandler>(&mut self, handler: &mut H) -> Result<()> {
        let mut last_tick = Instant::now();
        let mut stopping_since: Option<Instant> = None;

        loop {
            let wait = self.tick.saturating_sub(last_tick.elapsed());
            if let Err(e) = self.poll_once(handler, wait) {
                tracing::error!("Reactor failed: {}", e);
                handler.on_shutdown(&mut self.registry);
                return Err(e);
            }

            let now = Instant::now();
            if now.duration_since(last_tick) >= self.tick {
                last_tick = now;
                handler.on_tick(&mut self.registry, now);
            }

            if stopping_since.is_none() && self.stop.is_stopped() {
                tracing::info!("Reactor stopping, draining sessions");
                stopping_since = Some(now);
                handler.on_stop(&mut self.registry);
            }

            if let Some(since) = stopping_since {
                if handler.is_drained() {
                    tracing::debug!("All sessions drained");
                    handler.on_shutdown(&mut self.registry);
                    return Ok(());
                }
                if now.duration_since(since) >= self.grace {
                    tracing::info!("Grace period expired, closing remaining sessions");
                    handler.on_shutdown(&mut self.registry);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(Token, Readiness)>,
        ticks: usize,
        stopped: bool,
        shutdown: bool,
        busy: bool,
    }

    impl EventHandler for Recorder {
        fn on_event(&mut self, _: &mut Registry, token: Token, ready: Readiness, _: Instant) {
            self.events.push((token, ready));
        }

        fn on_tick(&mut self, _: &mut Registry, _: Instant) {
            self.ticks += 1;
        }

        fn on_stop(&mut self, _: &mut Registry) {
            self.stopped = true;
        }

        fn is_drained(&self) -> bool {
            !self.busy
        }

        fn on_shutdown(&mut self, _: &mut Registry) {
            self.shutdown = true;
        }
    }

    #[test]
    fn test_readable_event_dispatched() {
        let mut reactor = ReactorLoop::new(DEFAULT_TICK, Duration::from_secs(1)).unwrap();
        let mut sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = sock.local_addr().unwrap();
        let token = reactor
            .registry()
            .register(&mut sock, Owner::Udp, Interest::READABLE)
            .unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        let mut recorder = Recorder::default();
        for _ in 0..20 {
            reactor
                .poll_once(&mut recorder, Duration::from_millis(100))
                .unwrap();
            if !recorder.events.is_empty() {
                break;
            }
        }
        assert_eq!(recorder.events[0].0, token);
        assert!(recorder.events[0].1.readable);
    }

    #[test]
    fn test_parked_socket_not_reported() {
        let mut reactor = ReactorLoop::new(DEFAULT_TICK, Duration::from_secs(1)).unwrap();
        let mut sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = sock.local_addr().unwrap();
        let token = reactor
            .registry()
            .register(&mut sock, Owner::Udp, Interest::READABLE)
            .unwrap();
        reactor.registry().modify(&mut sock, token, None).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        let mut recorder = Recorder::default();
        reactor
            .poll_once(&mut recorder, Duration::from_millis(100))
            .unwrap();
        assert!(recorder.events.is_empty());
    }

    #[test]
    fn test_stop_from_another_thread() {
        let mut reactor =
            ReactorLoop::new(Duration::from_millis(20), Duration::from_secs(5)).unwrap();
        let stop = reactor.stop_handle();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            stop.stop();
            stop.stop();
        });

        let mut recorder = Recorder::default();
        reactor.run(&mut recorder).unwrap();
        stopper.join().unwrap();

        assert!(recorder.stopped);
        assert!(recorder.shutdown);
        assert!(recorder.ticks >= 1);
    }

    #[test]
    fn test_grace_period_forces_shutdown() {
        let mut reactor =
            ReactorLoop::new(Duration::from_millis(10), Duration::from_millis(50)).unwrap();
        reactor.stop_handle().stop();

        let mut recorder = Recorder {
            busy: true,
            ..Default::default()
        };
        let started = Instant::now();
        reactor.run(&mut recorder).unwrap();

        assert!(recorder.shutdown);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
