//! File envelope v1.
//!
//! V1 Header:
//! ```text
//! MAGIC (4) | VERSION (1) | ALGORITHM (1) | CHUNK_SIZE (4, LE) | NONCE_LEN (1) | BASE_NONCE | KEY_ID_LEN (1) | KEY_ID
//! ```
//!
//! The header is followed by chunk records, see [`crate::codec`].

use std::io::Read;

use super::{EnvelopeHeader, MAGIC, malformed, read_exact};
use crate::codec::MAX_CHUNK_SIZE;
use crate::crypto::EncryptionAlgorithm;
use crate::error::Result;

/// Current file format version.
pub const VERSION_V1: u8 = 1;

const ALG_LEN: usize = 1;
const CHUNK_SIZE_LEN: usize = 4;

/// Reads the v1 fields following magic and version, appending every byte
/// consumed to `raw`.
///
/// # Errors
///
/// Returns an error if the header is truncated or has invalid fields.
pub fn read<R: Read>(reader: &mut R, raw: &mut Vec<u8>) -> Result<EnvelopeHeader> {
    let mut fixed = [0u8; ALG_LEN + CHUNK_SIZE_LEN + 1];
    read_exact(reader, &mut fixed, "header")?;
    raw.extend_from_slice(&fixed);

    let algorithm = EncryptionAlgorithm::from_id(fixed[0])
        .filter(|alg| alg.is_authenticated())
        .ok_or_else(|| malformed(format!("unsupported algorithm id {}", fixed[0])))?;

    let chunk_size = u32::from_le_bytes([fixed[1], fixed[2], fixed[3], fixed[4]]);
    if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_SIZE {
        return Err(malformed(format!("invalid chunk size {chunk_size}")));
    }

    let nonce_len = usize::from(fixed[5]);
    if nonce_len != algorithm.nonce_len() {
        return Err(malformed(format!(
            "nonce length {nonce_len} does not match {algorithm}"
        )));
    }
    let mut base_nonce = vec![0u8; nonce_len];
    read_exact(reader, &mut base_nonce, "header")?;
    raw.extend_from_slice(&base_nonce);

    let mut key_id_len = [0u8; 1];
    read_exact(reader, &mut key_id_len, "header")?;
    raw.push(key_id_len[0]);
    if key_id_len[0] == 0 {
        return Err(malformed("empty key id"));
    }

    let mut key_id = vec![0u8; usize::from(key_id_len[0])];
    read_exact(reader, &mut key_id, "header")?;
    raw.extend_from_slice(&key_id);
    let key_id = String::from_utf8(key_id).map_err(|_| malformed("key id is not utf-8"))?;

    Ok(EnvelopeHeader {
        version: VERSION_V1,
        algorithm,
        chunk_size,
        base_nonce,
        key_id,
    })
}

/// Serializes a header to v1 format bytes.
///
/// # Errors
///
/// Returns an error if the version is not v1, the algorithm has no tag, or
/// the nonce or key id do not fit their length fields.
pub fn serialize(header: &EnvelopeHeader) -> Result<Vec<u8>> {
    if header.version() != VERSION_V1 {
        return Err(malformed("wrong version for v1 serializer"));
    }

    if !header.algorithm().is_authenticated() {
        return Err(malformed(format!(
            "{} cannot be used for file envelopes",
            header.algorithm()
        )));
    }

    if header.base_nonce().len() != header.algorithm().nonce_len() {
        return Err(malformed("invalid nonce length for v1"));
    }

    let key_id_len = u8::try_from(header.key_id().len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| malformed("invalid key id length for v1"))?;

    let mut buf = Vec::with_capacity(16 + header.base_nonce().len() + header.key_id().len());

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_V1);

    buf.push(header.algorithm().id());
    buf.extend_from_slice(&header.chunk_size().to_le_bytes());

    buf.push(header.base_nonce().len() as u8);
    buf.extend_from_slice(header.base_nonce());

    buf.push(key_id_len);
    buf.extend_from_slice(header.key_id().as_bytes());

    Ok(buf)
}
