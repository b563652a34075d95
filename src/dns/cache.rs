//! DNS cache with TTL awareness.
//!
//! Owned by the resolver and touched only from the reactor thread, so it
//! needs no locking. Expiry is checked against a caller-supplied clock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::trace;

/// Lower bound applied to answer TTLs (seconds).
pub const MIN_TTL: u32 = 60;

/// Upper bound applied to answer TTLs (seconds).
pub const MAX_TTL: u32 = 3600;

#[derive(Debug, Clone)]
struct CacheEntry {
    address: IpAddr,
    expires_at: Instant,
}

/// Hostname to address cache.
#[derive(Debug)]
pub struct DnsCache {
    entries: HashMap<String, CacheEntry>,
    min_ttl: u32,
    max_ttl: u32,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(MIN_TTL, MAX_TTL)
    }
}

impl DnsCache {
    pub fn new(min_ttl: u32, max_ttl: u32) -> Self {
        Self {
            entries: HashMap::new(),
            min_ttl,
            max_ttl,
        }
    }

    /// Unexpired address for `name`, if any.
    pub fn get(&self, name: &str, now: Instant) -> Option<IpAddr> {
        let entry = self.entries.get(&name.to_ascii_lowercase())?;
        if now < entry.expires_at {
            trace!("DNS cache hit: {}", name);
            Some(entry.address)
        } else {
            None
        }
    }

    /// Store an answer, clamping its TTL to the configured bounds.
    pub fn insert(&mut self, name: &str, address: IpAddr, ttl: u32, now: Instant) {
        let ttl = ttl.clamp(self.min_ttl, self.max_ttl);
        self.entries.insert(
            name.to_ascii_lowercase(),
            CacheEntry {
                address,
                expires_at: now + Duration::from_secs(u64::from(ttl)),
            },
        );
        trace!("DNS cache insert: {} TTL={}", name, ttl);
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
