//! AES-CFB stream cipher contexts.
//!
//! The encryptor prefixes a random IV to its first output; the decryptor
//! holds back input until a full IV has arrived. CFB feedback state carries
//! across calls, so chunk boundaries are irrelevant.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};

use crate::crypto::kdf::MasterKey;
use crate::crypto::{CipherKind, SecureRandom};
use crate::error::{Error, Result};

enum CfbEncrypt {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

enum CfbDecrypt {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

fn invalid_length(kind: CipherKind) -> Error {
    Error::crypto(format!("invalid key or IV length for {}", kind))
}

impl CfbEncrypt {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let cipher = match kind {
            CipherKind::Aes128Cfb => CfbEncrypt::Aes128(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| invalid_length(kind))?,
            ),
            CipherKind::Aes192Cfb => CfbEncrypt::Aes192(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| invalid_length(kind))?,
            ),
            CipherKind::Aes256Cfb => CfbEncrypt::Aes256(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| invalid_length(kind))?,
            ),
            other => return Err(Error::crypto(format!("{} is not a stream cipher", other))),
        };
        Ok(cipher)
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CfbEncrypt::Aes128(c) => c.encrypt(data),
            CfbEncrypt::Aes192(c) => c.encrypt(data),
            CfbEncrypt::Aes256(c) => c.encrypt(data),
        }
    }
}

impl CfbDecrypt {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let cipher = match kind {
            CipherKind::Aes128Cfb => CfbDecrypt::Aes128(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| invalid_length(kind))?,
            ),
            CipherKind::Aes192Cfb => CfbDecrypt::Aes192(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| invalid_length(kind))?,
            ),
            CipherKind::Aes256Cfb => CfbDecrypt::Aes256(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| invalid_length(kind))?,
            ),
            other => return Err(Error::crypto(format!("{} is not a stream cipher", other))),
        };
        Ok(cipher)
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CfbDecrypt::Aes128(c) => c.decrypt(data),
            CfbDecrypt::Aes192(c) => c.decrypt(data),
            CfbDecrypt::Aes256(c) => c.decrypt(data),
        }
    }
}

/// Encrypting half of a stream-cipher connection.
pub struct StreamEncryptor {
    kind: CipherKind,
    master: MasterKey,
    cipher: Option<CfbEncrypt>,
}

impl StreamEncryptor {
    pub(crate) fn new(kind: CipherKind, master: MasterKey) -> Self {
        Self {
            kind,
            master,
            cipher: None,
        }
    }

    /// Encrypt `plaintext`; the first call's output starts with the IV.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.kind.iv_len() + plaintext.len());

        if self.cipher.is_none() {
            let iv = SecureRandom::vec(self.kind.iv_len());
            self.cipher = Some(CfbEncrypt::new(self.kind, self.master.as_bytes(), &iv)?);
            out.extend_from_slice(&iv);
        }

        let start = out.len();
        out.extend_from_slice(plaintext);
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut out[start..]);
        }
        Ok(out)
    }
}

/// Decrypting half of a stream-cipher connection.
pub struct StreamDecryptor {
    kind: CipherKind,
    master: MasterKey,
    cipher: Option<CfbDecrypt>,
    iv: Vec<u8>,
}

impl StreamDecryptor {
    pub(crate) fn new(kind: CipherKind, master: MasterKey) -> Self {
        Self {
            kind,
            master,
            cipher: None,
            iv: Vec::new(),
        }
    }

    /// Decrypt `ciphertext`; input is consumed into the IV until one is complete.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut rest = ciphertext;

        if self.cipher.is_none() {
            let need = self.kind.iv_len() - self.iv.len();
            let take = need.min(rest.len());
            self.iv.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.iv.len() < self.kind.iv_len() {
                return Ok(Vec::new());
            }
            self.cipher = Some(CfbDecrypt::new(
                self.kind,
                self.master.as_bytes(),
                &self.iv,
            )?);
        }

        let mut out = rest.to_vec();
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut out);
        }
        Ok(out)
    }
}

/// Encrypt one UDP packet: `iv || cfb(payload)`.
pub fn encrypt_packet(kind: CipherKind, master: &MasterKey, payload: &[u8]) -> Result<Vec<u8>> {
    StreamEncryptor::new(kind, master.clone()).encrypt(payload)
}

/// Decrypt one UDP packet produced by [`encrypt_packet`].
pub fn decrypt_packet(kind: CipherKind, master: &MasterKey, packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < kind.iv_len() {
        return Err(Error::Decryption);
    }
    StreamDecryptor::new(kind, master.clone()).decrypt(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(kind: CipherKind) -> (StreamEncryptor, StreamDecryptor) {
        let master = MasterKey::derive(b"stream-password", kind.key_len());
        (
            StreamEncryptor::new(kind, master.clone()),
            StreamDecryptor::new(kind, master),
        )
    }

    #[test]
    fn test_iv_prefixed_once() {
        let (mut enc, _) = pair(CipherKind::Aes256Cfb);
        assert_eq!(enc.encrypt(b"hello").unwrap().len(), 16 + 5);
        assert_eq!(enc.encrypt(b"hello").unwrap().len(), 5);
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let (mut enc, _) = pair(CipherKind::Aes128Cfb);
        let out = enc.encrypt(b"plaintext that should not leak").unwrap();
        assert_ne!(&out[16..], b"plaintext that should not leak");
    }

    #[test]
    fn test_byte_at_a_time_decrypt() {
        let (mut enc, mut dec) = pair(CipherKind::Aes192Cfb);
        let mut ciphertext = enc.encrypt(b"first half, ").unwrap();
        ciphertext.extend(enc.encrypt(b"second half").unwrap());

        let mut plain = Vec::new();
        for byte in &ciphertext {
            plain.extend(dec.decrypt(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(plain, b"first half, second half");
    }

    #[test]
    fn test_packet_roundtrip() {
        let kind = CipherKind::Aes256Cfb;
        let master = MasterKey::derive(b"udp", kind.key_len());
        let packet = encrypt_packet(kind, &master, b"datagram").unwrap();
        assert_eq!(decrypt_packet(kind, &master, &packet).unwrap(), b"datagram");
        assert!(decrypt_packet(kind, &master, &packet[..8]).is_err());
    }
}
