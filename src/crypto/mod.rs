//! Cryptographic framing for tunnel traffic.
//!
//! This module provides:
//! - The supported cipher table ([`CipherKind`])
//! - Password-based key derivation (EVP_BytesToKey, HKDF-SHA1 subkeys)
//! - Per-direction stateful contexts for TCP streams
//! - One-shot packet sealing for UDP datagrams
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod cipher;
mod kdf;
mod random;
mod stream;

pub use aead::{Aead, AeadDecryptor, AeadEncryptor, AeadKey, Nonce};
pub use cipher::{CipherCategory, CipherKind};
pub use kdf::{derive_subkey, evp_bytes_to_key, Hkdf, MasterKey};
pub use random::SecureRandom;
pub use stream::{StreamDecryptor, StreamEncryptor};

use crate::error::{Error, Result};

/// Size of AEAD nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Largest payload carried by one AEAD record.
pub const MAX_PAYLOAD_SIZE: usize = 0x3fff;

/// Cipher configuration shared by every connection of a relay.
///
/// Construct once from the configured method and password, then open a
/// fresh context per connection direction.
#[derive(Clone, Debug)]
pub struct Cryptor {
    kind: CipherKind,
    master: MasterKey,
}

impl Cryptor {
    /// Build a cryptor from a method name and password.
    pub fn new(method: &str, password: &str) -> Result<Self> {
        let kind: CipherKind = method.parse()?;
        Self::with_kind(kind, password)
    }

    /// Build a cryptor for an already-parsed cipher kind.
    pub fn with_kind(kind: CipherKind, password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::config("password must not be empty"));
        }
        Ok(Self {
            kind,
            master: MasterKey::derive(password.as_bytes(), kind.key_len()),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Open a context for the outgoing direction of one connection.
    pub fn new_encrypt_session(&self) -> EncryptSession {
        match self.kind.category() {
            CipherCategory::Stream => {
                EncryptSession::Stream(StreamEncryptor::new(self.kind, self.master.clone()))
            }
            CipherCategory::Aead => {
                EncryptSession::Aead(AeadEncryptor::new(self.kind, self.master.clone()))
            }
        }
    }

    /// Open a context for the incoming direction of one connection.
    pub fn new_decrypt_session(&self) -> DecryptSession {
        match self.kind.category() {
            CipherCategory::Stream => {
                DecryptSession::Stream(StreamDecryptor::new(self.kind, self.master.clone()))
            }
            CipherCategory::Aead => {
                DecryptSession::Aead(AeadDecryptor::new(self.kind, self.master.clone()))
            }
        }
    }

    /// Encrypt one self-contained datagram with a fresh IV or salt.
    pub fn encrypt_packet(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.kind.category() {
            CipherCategory::Stream => stream::encrypt_packet(self.kind, &self.master, payload),
            CipherCategory::Aead => aead::encrypt_packet(self.kind, &self.master, payload),
        }
    }

    /// Decrypt one datagram produced by [`Cryptor::encrypt_packet`].
    pub fn decrypt_packet(&self, packet: &[u8]) -> Result<Vec<u8>> {
        match self.kind.category() {
            CipherCategory::Stream => stream::decrypt_packet(self.kind, &self.master, packet),
            CipherCategory::Aead => aead::decrypt_packet(self.kind, &self.master, packet),
        }
    }
}

/// Outgoing per-connection cipher state. Calls must follow data order.
pub enum EncryptSession {
    Stream(StreamEncryptor),
    Aead(AeadEncryptor),
}

impl EncryptSession {
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            EncryptSession::Stream(s) => s.encrypt(plaintext),
            EncryptSession::Aead(s) => s.encrypt(plaintext),
        }
    }
}

/// Incoming per-connection cipher state. Calls must follow data order.
pub enum DecryptSession {
    Stream(StreamDecryptor),
    Aead(AeadDecryptor),
}

impl DecryptSession {
    /// Decrypt the next ciphertext fragment.
    ///
    /// On [`Error::Decryption`] nothing from this call may be forwarded and
    /// the connection must be closed.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            DecryptSession::Stream(s) => s.decrypt(ciphertext),
            DecryptSession::Aead(s) => s.decrypt(ciphertext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_kind() -> impl Strategy<Value = CipherKind> {
        prop::sample::select(CipherKind::ALL.to_vec())
    }

    fn arb_aead_kind() -> impl Strategy<Value = CipherKind> {
        prop_oneof![
            Just(CipherKind::Aes128Gcm),
            Just(CipherKind::Aes256Gcm),
            Just(CipherKind::ChaCha20Poly1305),
        ]
    }

    /// Split `data` at the given cut points (taken modulo its length).
    fn split_at_cuts(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
        let mut points: Vec<usize> = cuts
            .iter()
            .map(|c| if data.is_empty() { 0 } else { c % (data.len() + 1) })
            .collect();
        points.push(0);
        points.push(data.len());
        points.sort_unstable();
        points.dedup();
        points.windows(2).map(|w| data[w[0]..w[1]].to_vec()).collect()
    }

    #[test]
    fn test_unknown_method_is_config_error() {
        assert!(matches!(
            Cryptor::new("des-cbc", "pw"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Cryptor::new("aes-256-gcm", ""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_message_roundtrip() {
        for kind in CipherKind::ALL {
            let cryptor = Cryptor::with_kind(kind, "pw").unwrap();
            let mut enc = cryptor.new_encrypt_session();
            let mut dec = cryptor.new_decrypt_session();
            let ciphertext = enc.encrypt(b"").unwrap();
            assert_eq!(ciphertext.len(), kind.iv_len());
            assert!(dec.decrypt(&ciphertext).unwrap().is_empty());
        }
    }

    #[test]
    fn test_max_size_message_roundtrip() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        for kind in CipherKind::ALL {
            let cryptor = Cryptor::with_kind(kind, "pw").unwrap();
            let ciphertext = cryptor.new_encrypt_session().encrypt(&data).unwrap();
            let plain = cryptor.new_decrypt_session().decrypt(&ciphertext).unwrap();
            assert_eq!(plain, data, "{}", kind);
        }
    }

    #[test]
    fn test_max_size_split_at_record_boundaries() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
        let record = 2 + MAX_PAYLOAD_SIZE + 2 * TAG_SIZE;

        for kind in CipherKind::ALL {
            let cryptor = Cryptor::with_kind(kind, "pw").unwrap();

            // Writes cut one byte either side of each full record.
            let write_cuts: Vec<usize> = (1..=data.len() / MAX_PAYLOAD_SIZE)
                .flat_map(|k| [k * MAX_PAYLOAD_SIZE - 1, k * MAX_PAYLOAD_SIZE + 1])
                .collect();
            let mut enc = cryptor.new_encrypt_session();
            let mut ciphertext = Vec::new();
            for piece in split_at_cuts(&data, &write_cuts) {
                ciphertext.extend(enc.encrypt(&piece).unwrap());
            }
            let plain = cryptor.new_decrypt_session().decrypt(&ciphertext).unwrap();
            assert_eq!(plain, data, "{} write cuts", kind);

            // Reads cut at, before and after every record edge of one write.
            let ciphertext = cryptor.new_encrypt_session().encrypt(&data).unwrap();
            let read_cuts: Vec<usize> = (0..=data.len() / MAX_PAYLOAD_SIZE + 1)
                .map(|k| kind.iv_len() + k * record)
                .filter(|&edge| edge < ciphertext.len())
                .flat_map(|edge| [edge - 1, edge, edge + 1])
                .collect();
            let mut dec = cryptor.new_decrypt_session();
            let mut plain = Vec::new();
            for piece in split_at_cuts(&ciphertext, &read_cuts) {
                plain.extend(dec.decrypt(&piece).unwrap());
            }
            assert_eq!(plain, data, "{} read cuts", kind);
        }
    }

    #[test]
    fn test_directions_are_independent() {
        let cryptor = Cryptor::new("aes-128-gcm", "pw").unwrap();
        let mut a = cryptor.new_encrypt_session();
        let mut b = cryptor.new_encrypt_session();
        // Fresh salts, so identical plaintext never produces identical output.
        assert_ne!(a.encrypt(b"same").unwrap(), b.encrypt(b"same").unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_roundtrip_any_chunking(
            kind in arb_kind(),
            data in prop::collection::vec(any::<u8>(), 0..=64 * 1024),
            write_cuts in prop::collection::vec(any::<usize>(), 0..6),
            read_cuts in prop::collection::vec(any::<usize>(), 0..12),
        ) {
            let cryptor = Cryptor::with_kind(kind, "property").unwrap();
            let mut enc = cryptor.new_encrypt_session();
            let mut dec = cryptor.new_decrypt_session();

            let mut ciphertext = Vec::new();
            for piece in split_at_cuts(&data, &write_cuts) {
                ciphertext.extend(enc.encrypt(&piece).unwrap());
            }
            if data.is_empty() {
                ciphertext.extend(enc.encrypt(&[]).unwrap());
            }

            let mut plain = Vec::new();
            for piece in split_at_cuts(&ciphertext, &read_cuts) {
                plain.extend(dec.decrypt(&piece).unwrap());
            }
            prop_assert_eq!(plain, data);
        }

        #[test]
        fn prop_aead_bit_flip_always_rejected(
            kind in arb_aead_kind(),
            data in prop::collection::vec(any::<u8>(), 1..2048),
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let cryptor = Cryptor::with_kind(kind, "property").unwrap();
            let mut ciphertext = cryptor.new_encrypt_session().encrypt(&data).unwrap();
            let index = position % ciphertext.len();
            ciphertext[index] ^= 1 << bit;

            let result = cryptor.new_decrypt_session().decrypt(&ciphertext);
            prop_assert!(matches!(result, Err(Error::Decryption)));
        }

        #[test]
        fn prop_packet_roundtrip(
            kind in arb_kind(),
            data in prop::collection::vec(any::<u8>(), 0..1500),
        ) {
            let cryptor = Cryptor::with_kind(kind, "property").unwrap();
            let packet = cryptor.encrypt_packet(&data).unwrap();
            prop_assert_eq!(cryptor.decrypt_packet(&packet).unwrap(), data);
        }
    }
}
