//! OS-backed randomness for salts, IVs and DNS query ids.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random source (the OS entropy pool).
pub struct SecureRandom;

impl SecureRandom {
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// `len` fresh random bytes.
    pub fn vec(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        Self::fill(&mut buf);
        buf
    }

    /// Random query identifier.
    pub fn u16() -> u16 {
        (OsRng.next_u32() & 0xffff) as u16
    }
}
