//! Error types for the relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a relay.
///
/// Everything except [`Error::Config`] and [`Error::Reactor`] is local to a
/// single session: the session that hit it is closed and the reactor keeps
/// running.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed handshake or relay header bytes
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication tag mismatch or malformed ciphertext record
    #[error("decryption failed")]
    Decryption,

    /// Cryptographic primitive misuse (bad key or IV length)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Name resolution timed out or was answered negatively
    #[error("DNS error: {0}")]
    Dns(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// File descriptor limit, full queue, connection cap
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unrecoverable multiplexer failure
    #[error("reactor failure: {0}")]
    Reactor(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new DNS error
    pub fn dns(msg: impl Into<String>) -> Self {
        Error::Dns(msg.into())
    }

    /// Create a new resource exhaustion error
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    /// Errors that terminate the process rather than one session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Reactor(_))
    }

    /// Errors handled by closing the offending session only.
    pub fn is_session_local(&self) -> bool {
        !self.is_fatal()
    }

    /// Check if this error indicates tampered or mis-keyed ciphertext
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Decryption)
    }
}
