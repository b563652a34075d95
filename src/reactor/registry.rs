//! Socket registration table.
//!
//! Every live socket has exactly one entry, keyed by its [`Token`]. Tokens
//! are handed out from a counter and never reused, so a readiness event
//! that races with a close can only ever miss; it cannot be delivered to a
//! socket that was opened afterwards.

use std::collections::HashMap;
use std::io;

use mio::event::Source;
use mio::{Interest, Token};

use crate::error::{Error, Result};

/// Token reserved for the loop's own waker.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Manager that owns a registered socket; events are routed by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Dns,
    Tcp,
    Udp,
}

#[derive(Debug)]
struct Registration {
    owner: Owner,
    /// `None` while the socket is parked with no interest at all.
    interest: Option<Interest>,
}

/// Registration table backed by the OS multiplexer.
pub struct Registry {
    inner: mio::Registry,
    entries: HashMap<Token, Registration>,
    next_token: usize,
}

impl Registry {
    pub(crate) fn new(inner: mio::Registry) -> Self {
        Self {
            inner,
            entries: HashMap::new(),
            next_token: WAKE_TOKEN.0 + 1,
        }
    }

    /// Register `source` for `interest`, returning its fresh token.
    pub fn register<S>(&mut self, source: &mut S, owner: Owner, interest: Interest) -> Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.inner.register(source, token, interest)?;
        self.entries.insert(
            token,
            Registration {
                owner,
                interest: Some(interest),
            },
        );
        Ok(token)
    }

    /// Change the interest set of a registered socket.
    ///
    /// `None` parks the socket: it stays in the table but the multiplexer
    /// stops reporting it until interest is restored.
    pub fn modify<S>(&mut self, source: &mut S, token: Token, interest: Option<Interest>) -> Result<()>
    where
        S: Source + ?Sized,
    {
        let entry = self.entries.get_mut(&token).ok_or_else(|| {
            Error::Network(io::Error::new(
                io::ErrorKind::NotFound,
                format!("token {} is not registered", token.0),
            ))
        })?;

        match (entry.interest, interest) {
            (Some(old), Some(new)) if old == new => {}
            (Some(_), Some(new)) => self.inner.reregister(source, token, new)?,
            (Some(_), None) => self.inner.deregister(source)?,
            (None, Some(new)) => self.inner.register(source, token, new)?,
            (None, None) => {}
        }
        entry.interest = interest;
        Ok(())
    }

    /// Remove a socket. Must be called before the socket is dropped.
    ///
    /// Unknown tokens are ignored, so unregistering twice is harmless.
    pub fn unregister<S>(&mut self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        if let Some(entry) = self.entries.remove(&token) {
            if entry.interest.is_some() {
                self.inner.deregister(source)?;
            }
        }
        Ok(())
    }

    /// Owning manager of a live token.
    pub fn owner(&self, token: Token) -> Option<Owner> {
        self.entries.get(&token).map(|e| e.owner)
    }

    /// Current interest of a live token (`None` if parked or unknown).
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.entries.get(&token).and_then(|e| e.interest)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;
    use mio::Poll;

    fn registry() -> (Poll, Registry) {
        let poll = Poll::new().unwrap();
        let registry = Registry::new(poll.registry().try_clone().unwrap());
        (poll, registry)
    }

    #[test]
    fn test_tokens_are_never_reused() {
        let (_poll, mut registry) = registry();
        let mut a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let t1 = registry.register(&mut a, Owner::Udp, Interest::READABLE).unwrap();
        registry.unregister(&mut a, t1).unwrap();

        let mut b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let t2 = registry.register(&mut b, Owner::Dns, Interest::READABLE).unwrap();
        assert_ne!(t1, t2);
        assert_ne!(t2, WAKE_TOKEN);
        assert_eq!(registry.owner(t1), None);
        assert_eq!(registry.owner(t2), Some(Owner::Dns));
    }

    #[test]
    fn test_park_and_resume() {
        let (_poll, mut registry) = registry();
        let mut sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = registry.register(&mut sock, Owner::Udp, Interest::READABLE).unwrap();

        registry.modify(&mut sock, token, None).unwrap();
        assert!(registry.contains(token));
        assert_eq!(registry.interest(token), None);

        registry
            .modify(&mut sock, token, Some(Interest::READABLE | Interest::WRITABLE))
            .unwrap();
        assert_eq!(
            registry.interest(token),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (_poll, mut registry) = registry();
        let mut sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = registry.register(&mut sock, Owner::Tcp, Interest::READABLE).unwrap();

        registry.unregister(&mut sock, token).unwrap();
        registry.unregister(&mut sock, token).unwrap();
        assert!(registry.is_empty());
        assert!(registry.modify(&mut sock, token, None).is_err());
    }
}
