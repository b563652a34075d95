//! Supported cipher methods and their parameters.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Construction family of a cipher method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherCategory {
    /// Stream cipher: random IV sent once, keystream applied byte-by-byte
    Stream,
    /// AEAD cipher: random salt sent once, length-prefixed sealed records
    Aead,
}

/// A cipher method identifier, as it appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// All supported methods.
    pub const ALL: [CipherKind; 6] = [
        CipherKind::Aes128Cfb,
        CipherKind::Aes192Cfb,
        CipherKind::Aes256Cfb,
        CipherKind::Aes128Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
    ];

    /// Canonical method name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }

    pub fn category(&self) -> CipherCategory {
        match self {
            CipherKind::Aes128Cfb | CipherKind::Aes192Cfb | CipherKind::Aes256Cfb => {
                CipherCategory::Stream
            }
            CipherKind::Aes128Gcm | CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => {
                CipherCategory::Aead
            }
        }
    }

    pub fn is_aead(&self) -> bool {
        self.category() == CipherCategory::Aead
    }

    /// Length of the derived master key in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Cfb | CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Cfb | CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Length of the per-connection prefix: IV for stream ciphers, salt for AEAD.
    pub fn iv_len(&self) -> usize {
        match self.category() {
            CipherCategory::Stream => 16,
            CipherCategory::Aead => self.key_len(),
        }
    }

    /// Authentication tag length (zero for stream ciphers).
    pub fn tag_len(&self) -> usize {
        match self.category() {
            CipherCategory::Stream => 0,
            CipherCategory::Aead => super::TAG_SIZE,
        }
    }
}

impl FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => Err(Error::config(format!("unsupported cipher method: {}", other))),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
