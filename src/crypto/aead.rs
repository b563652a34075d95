//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Wraps AES-GCM and ChaCha20-Poly1305 behind one type and implements the
//! record framing used on the wire:
//!
//! ```text
//! [salt] [seal(len BE u16)][tag] [seal(payload)][tag] [seal(len)][tag] ...
//! ```
//!
//! Each seal/open consumes one nonce; nonces are a little-endian counter
//! starting at zero, so both directions must process records in order.

use aes_gcm::aead::generic_array::{typenum::U12, GenericArray};
use aes_gcm::aead::{Aead as AeadTrait, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::kdf::{derive_subkey, MasterKey};
use crate::crypto::{CipherKind, SecureRandom, MAX_PAYLOAD_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Size of the sealed length prefix of every record.
const LENGTH_RECORD_SIZE: usize = 2 + TAG_SIZE;

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey(Vec<u8>);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// A nonce (number used once) for AEAD operations.
///
/// The counter occupies the first 8 bytes, little-endian; the last 4 bytes
/// stay zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a 64-bit counter value.
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Get the current counter value (for diagnostics).
    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(counter)
    }

    /// Increment the counter portion of the nonce.
    pub fn increment(&mut self) {
        let next = self.counter().wrapping_add(1);
        self.0[..8].copy_from_slice(&next.to_le_bytes());
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Self::new(0)
    }
}

#[allow(clippy::large_enum_variant)]
enum AeadInner {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

/// One keyed AEAD primitive.
pub struct Aead {
    inner: AeadInner,
}

impl Aead {
    /// Create a new AEAD instance for `kind` with the given key.
    pub fn new(kind: CipherKind, key: &AeadKey) -> Result<Self> {
        let bad_key = |_| Error::crypto(format!("invalid key length for {}", kind));
        let inner = match kind {
            CipherKind::Aes128Gcm => {
                AeadInner::Aes128Gcm(Aes128Gcm::new_from_slice(key.as_bytes()).map_err(bad_key)?)
            }
            CipherKind::Aes256Gcm => {
                AeadInner::Aes256Gcm(Aes256Gcm::new_from_slice(key.as_bytes()).map_err(bad_key)?)
            }
            CipherKind::ChaCha20Poly1305 => AeadInner::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(bad_key)?,
            ),
            other => {
                return Err(Error::crypto(format!("{} is not an AEAD cipher", other)));
            }
        };
        Ok(Self { inner })
    }

    /// Encrypt plaintext. Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        let n: &GenericArray<u8, U12> = GenericArray::from_slice(nonce.as_bytes());
        let sealed = match &self.inner {
            AeadInner::Aes128Gcm(c) => c.encrypt(n, plaintext),
            AeadInner::Aes256Gcm(c) => c.encrypt(n, plaintext),
            AeadInner::ChaCha20Poly1305(c) => c.encrypt(n, plaintext),
        };
        sealed.map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext with appended tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decryption`] if authentication fails (wrong key,
    /// tampered data, truncated input).
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Decryption);
        }

        let n: &GenericArray<u8, U12> = GenericArray::from_slice(nonce.as_bytes());
        let opened = match &self.inner {
            AeadInner::Aes128Gcm(c) => c.decrypt(n, ciphertext),
            AeadInner::Aes256Gcm(c) => c.decrypt(n, ciphertext),
            AeadInner::ChaCha20Poly1305(c) => c.decrypt(n, ciphertext),
        };
        opened.map_err(|_| Error::Decryption)
    }
}

/// Encrypting half of an AEAD stream.
pub struct AeadEncryptor {
    kind: CipherKind,
    master: MasterKey,
    cipher: Option<Aead>,
    nonce: Nonce,
}

impl AeadEncryptor {
    pub(crate) fn new(kind: CipherKind, master: MasterKey) -> Self {
        Self {
            kind,
            master,
            cipher: None,
            nonce: Nonce::default(),
        }
    }

    /// Seal `plaintext` into records, prefixing the salt on first use.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let records = plaintext.len().div_ceil(MAX_PAYLOAD_SIZE);
        let mut out = Vec::with_capacity(
            self.kind.iv_len() + plaintext.len() + records * (LENGTH_RECORD_SIZE + TAG_SIZE),
        );

        if self.cipher.is_none() {
            let salt = SecureRandom::vec(self.kind.iv_len());
            let subkey = derive_subkey(&self.master, &salt)?;
            self.cipher = Some(Aead::new(self.kind, &subkey)?);
            out.extend_from_slice(&salt);
        }
        let cipher = match self.cipher.as_ref() {
            Some(cipher) => cipher,
            None => return Err(Error::crypto("AEAD encryptor not initialized")),
        };

        for chunk in plaintext.chunks(MAX_PAYLOAD_SIZE) {
            let len = (chunk.len() as u16).to_be_bytes();
            out.extend_from_slice(&cipher.encrypt(&self.nonce, &len)?);
            self.nonce.increment();
            out.extend_from_slice(&cipher.encrypt(&self.nonce, chunk)?);
            self.nonce.increment();
        }

        Ok(out)
    }
}

/// Decrypting half of an AEAD stream.
///
/// Ciphertext may arrive in arbitrary fragments; plaintext is released
/// only for records whose tag verified. After the first failure the
/// decryptor is poisoned and every later call fails.
pub struct AeadDecryptor {
    kind: CipherKind,
    master: MasterKey,
    cipher: Option<Aead>,
    nonce: Nonce,
    buffer: BytesMut,
    payload_len: Option<usize>,
    poisoned: bool,
}

impl AeadDecryptor {
    pub(crate) fn new(kind: CipherKind, master: MasterKey) -> Self {
        Self {
            kind,
            master,
            cipher: None,
            nonce: Nonce::default(),
            buffer: BytesMut::new(),
            payload_len: None,
            poisoned: false,
        }
    }

    /// Feed ciphertext; returns the plaintext of every record completed by it.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.poisoned {
            return Err(Error::Decryption);
        }
        self.buffer.extend_from_slice(ciphertext);

        match self.drain_records() {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.poisoned = true;
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Bytes received but not yet part of a complete record.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain_records(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        if self.cipher.is_none() {
            let salt_len = self.kind.iv_len();
            if self.buffer.len() < salt_len {
                return Ok(out);
            }
            let salt = self.buffer.split_to(salt_len);
            let subkey = derive_subkey(&self.master, &salt)?;
            self.cipher = Some(Aead::new(self.kind, &subkey)?);
        }
        let cipher = match self.cipher.as_ref() {
            Some(cipher) => cipher,
            None => return Err(Error::crypto("AEAD decryptor not initialized")),
        };

        loop {
            match self.payload_len {
                None => {
                    if self.buffer.len() < LENGTH_RECORD_SIZE {
                        break;
                    }
                    let len = cipher.decrypt(&self.nonce, &self.buffer[..LENGTH_RECORD_SIZE])?;
                    self.nonce.increment();
                    self.buffer.advance(LENGTH_RECORD_SIZE);

                    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                    if len > MAX_PAYLOAD_SIZE {
                        return Err(Error::Decryption);
                    }
                    self.payload_len = Some(len);
                }
                Some(len) => {
                    if self.buffer.len() < len + TAG_SIZE {
                        break;
                    }
                    let payload = cipher.decrypt(&self.nonce, &self.buffer[..len + TAG_SIZE])?;
                    self.nonce.increment();
                    self.buffer.advance(len + TAG_SIZE);
                    self.payload_len = None;
                    out.extend_from_slice(&payload);
                }
            }
        }

        Ok(out)
    }
}

/// Seal one UDP packet: `salt || seal(nonce 0, payload)`.
pub fn encrypt_packet(kind: CipherKind, master: &MasterKey, payload: &[u8]) -> Result<Vec<u8>> {
    let salt = SecureRandom::vec(kind.iv_len());
    let subkey = derive_subkey(master, &salt)?;
    let sealed = Aead::new(kind, &subkey)?.encrypt(&Nonce::default(), payload)?;

    let mut out = salt;
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open one UDP packet produced by [`encrypt_packet`].
pub fn decrypt_packet(kind: CipherKind, master: &MasterKey, packet: &[u8]) -> Result<Vec<u8>> {
    let salt_len = kind.iv_len();
    if packet.len() < salt_len + TAG_SIZE {
        return Err(Error::Decryption);
    }
    let (salt, sealed) = packet.split_at(salt_len);
    let subkey = derive_subkey(master, salt)?;
    Aead::new(kind, &subkey)?.decrypt(&Nonce::default(), sealed)
}
