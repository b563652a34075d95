//! # ssrelay
//!
//! An event-driven, encrypted SOCKS5 tunnel. The same core runs on both
//! ends of the tunnel:
//!
//! ```text
//!  app ──SOCKS5──► [local relay] ══ encrypted ══► [server relay] ──► target
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  relay: start/stop lifecycle, event dispatch by owner   │
//! ├──────────────────────────┬──────────────────────────────┤
//! │  tcprelay (sessions)     │  udprelay (LRU NAT table)    │
//! ├──────────────────────────┴──────────────────────────────┤
//! │  socks5 codec │ crypto (stream + AEAD) │ dns resolver   │
//! ├─────────────────────────────────────────────────────────┤
//! │  reactor: single-threaded readiness loop over mio       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one reactor thread. Handlers never block: sockets are
//! non-blocking, name resolution is itself a reactor client, and a slow peer
//! only ever pauses the socket feeding it.
//!
//! ## Example
//!
//! ```no_run
//! use ssrelay::RelayConfig;
//!
//! let config = RelayConfig::local("203.0.113.7", 8388, "secret", "aes-256-gcm");
//! let handle = ssrelay::start(config)?;
//! println!("SOCKS5 on {}", handle.local_addr());
//! handle.stop()?;
//! # Ok::<(), ssrelay::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod reactor;
pub mod relay;
pub mod socks5;
pub mod tcprelay;
pub mod udprelay;

pub use config::{Mode, RelayConfig, RelayConfigFile};
pub use crypto::{CipherKind, Cryptor};
pub use error::{Error, Result};
pub use relay::{start, stop, RelayHandle};
