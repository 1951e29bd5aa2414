use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{CBC_IV_LEN, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::Error;

/// Symmetric schemes the service can seal payloads with.
///
/// All three take a 256-bit key. Only the AEAD variants produce a tag, so
/// only they can report tampering; AES-256-CBC is kept for payloads that
/// must be readable by older consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[default]
    #[serde(rename = "aes_256_gcm")]
    Aes256Gcm,
    #[serde(rename = "aes_256_cbc")]
    Aes256Cbc,
    #[serde(rename = "chacha20_poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    pub const ALL: [EncryptionAlgorithm; 3] = [
        EncryptionAlgorithm::Aes256Gcm,
        EncryptionAlgorithm::Aes256Cbc,
        EncryptionAlgorithm::ChaCha20Poly1305,
    ];

    pub const fn key_len(self) -> usize {
        KEY_LEN
    }

    pub const fn nonce_len(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => NONCE_LEN,
            Self::Aes256Cbc => CBC_IV_LEN,
        }
    }

    /// Length of the authentication tag, zero for CBC.
    pub const fn tag_len(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => TAG_LEN,
            Self::Aes256Cbc => 0,
        }
    }

    pub const fn is_authenticated(self) -> bool {
        self.tag_len() > 0
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes_256_gcm",
            Self::Aes256Cbc => "aes_256_cbc",
            Self::ChaCha20Poly1305 => "chacha20_poly1305",
        }
    }

    /// Stable numeric id used in file envelopes.
    pub const fn id(self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::Aes256Cbc => 2,
            Self::ChaCha20Poly1305 => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.id() == id)
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|alg| alg.as_str() == normalized)
            .ok_or_else(|| Error::UnknownAlgorithm(s.to_string()))
    }
}
