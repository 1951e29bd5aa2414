use thiserror::Error;

use crate::key::KeyPurpose;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no active key for purpose '{0}'")]
    NoActiveKey(KeyPurpose),

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("authentication failed: ciphertext or tag does not match")]
    AuthenticationFailure,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("chunk {index} failed authentication")]
    ChunkAuthentication { index: u64 },

    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid nonce length: expected {expected} bytes, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("unknown key purpose '{0}'")]
    UnknownPurpose(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("key store: {0}")]
    KeyStore(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("OS random generator unavailable")]
    Random,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Index of the envelope chunk that failed, if this is a chunk error.
    pub fn chunk_index(&self) -> Option<u64> {
        match self {
            Self::ChunkAuthentication { index } => Some(*index),
            _ => None,
        }
    }
}
