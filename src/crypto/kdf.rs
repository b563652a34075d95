//! Key Derivation Functions.
//!
//! The master key is derived from the password with OpenSSL's
//! `EVP_BytesToKey` (MD5, one iteration, no salt). AEAD sessions then derive
//! a per-connection subkey with HKDF-SHA1 keyed by the connection salt.

use hkdf::Hkdf as HkdfImpl;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::AeadKey;
use crate::error::{Error, Result};

/// HKDF info string for AEAD session subkeys.
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Password-derived key shared by every session of a [`Cryptor`](super::Cryptor).
///
/// Automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    /// Derive a `key_len`-byte key from a password.
    pub fn derive(password: &[u8], key_len: usize) -> Self {
        Self(evp_bytes_to_key(password, key_len))
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("len", &self.0.len()).finish()
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single round.
///
/// `D_i = MD5(D_{i-1} || password)`, concatenated until `key_len` bytes.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    prev.zeroize();
    key
}

/// HKDF key derivation using SHA-1.
pub struct Hkdf {
    prk: HkdfImpl<Sha1>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand the PRK to produce `len` bytes of output keying material.
    pub fn expand(&self, info: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut okm = vec![0u8; len];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }
}

/// Derive the AEAD subkey for one connection (or one UDP packet).
pub fn derive_subkey(master: &MasterKey, salt: &[u8]) -> Result<AeadKey> {
    let hkdf = Hkdf::new(Some(salt), master.as_bytes());
    let okm = hkdf.expand(SUBKEY_INFO, master.len())?;
    Ok(AeadKey::from_vec(okm))
}
