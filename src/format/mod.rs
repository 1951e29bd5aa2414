//! File envelope handling.
//!
//! Provides version-aware reading and serialization of the header that
//! starts every encrypted file. The raw header bytes are kept alongside the
//! parsed header because every chunk authenticates them.

use std::io::{self, Read};

use crate::crypto::{EncryptionAlgorithm, MAGIC_LEN, VER_LEN};
use crate::error::{Error, Result};

pub mod v1;

/// Magic bytes identifying a keyward file envelope ("KWFE").
pub const MAGIC: &[u8; MAGIC_LEN] = b"KWFE";
/// Latest format version
pub const CURRENT_VERSION: u8 = v1::VERSION_V1;

/// Parsed envelope header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    version: u8,
    algorithm: EncryptionAlgorithm,
    chunk_size: u32,
    base_nonce: Vec<u8>,
    key_id: String,
}

impl EnvelopeHeader {
    pub fn new(
        algorithm: EncryptionAlgorithm,
        chunk_size: u32,
        base_nonce: Vec<u8>,
        key_id: impl Into<String>,
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            algorithm,
            chunk_size,
            base_nonce,
            key_id: key_id.into(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Plaintext bytes per chunk.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn base_nonce(&self) -> &[u8] {
        &self.base_nonce
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Read a header from the start of `reader`.
///
/// Returns the parsed header together with the exact bytes it was read from.
/// Dispatches to the parser for the version found after the magic.
///
/// # Errors
///
/// Returns [`Error::MalformedEnvelope`] if the magic is wrong, the version
/// is unsupported or the header is truncated.
pub fn read_header<R: Read>(reader: &mut R) -> Result<(EnvelopeHeader, Vec<u8>)> {
    let mut raw = vec![0u8; MAGIC_LEN + VER_LEN];
    read_exact(reader, &mut raw, "header")?;

    if &raw[..MAGIC_LEN] != MAGIC {
        return Err(malformed("invalid magic"));
    }

    let version = raw[MAGIC_LEN];

    let header = match version {
        1 => v1::read(reader, &mut raw)?,
        _ => return Err(malformed(format!("unsupported version {version}"))),
    };
    Ok((header, raw))
}

/// Serializes a header to bytes.
///
/// # Errors
///
/// Returns an error if the version is unsupported or a field does not fit.
pub fn serialize(header: &EnvelopeHeader) -> Result<Vec<u8>> {
    match header.version() {
        1 => v1::serialize(header),
        version => Err(malformed(format!("unsupported version {version}"))),
    }
}

/// `read_exact` that reports a short read as a truncated envelope.
pub(crate) fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => malformed(format!("truncated {what}")),
        _ => Error::Io(e),
    })
}

pub(crate) fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedEnvelope(reason.into())
}
