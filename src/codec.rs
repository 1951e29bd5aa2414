//! Chunked streaming encryption for files.
//!
//! After the envelope header come chunk records:
//!
//! ```text
//! FINAL (1) | LEN (4, LE) | CIPHERTEXT (LEN) | TAG (16)
//! ```
//!
//! Chunk `i` is sealed with the base nonce whose last 8 bytes are XOR-ed
//! with `i` big-endian, and authenticates `header ‖ i (u64 LE) ‖ FINAL` as
//! associated data. Reordering, dropping or appending records therefore
//! fails verification, and exactly one record carries the final flag. An
//! empty input is a single final record of length zero.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::crypto::{Cipher, TAG_LEN};
use crate::error::{Error, Result};
use crate::format::{self, EnvelopeHeader, malformed, read_exact};

/// Plaintext bytes per chunk unless configured otherwise (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Largest chunk an envelope may declare (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const FLAG_LEN: usize = 1;
const LEN_LEN: usize = 4;
const COUNTER_LEN: usize = 8;

/// Cooperative cancellation for file operations.
///
/// Clones share the same flag. Checked once per chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Encrypt everything `reader` yields into an envelope on `writer`.
///
/// Holds at most two chunks in memory. Returns the number of chunk records
/// written.
pub(crate) fn encrypt_stream<R: Read, W: Write>(
    cipher: &Cipher,
    header: &EnvelopeHeader,
    mut reader: R,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<u64> {
    let header_bytes = format::serialize(header)?;
    writer.write_all(&header_bytes)?;

    let chunk_size = header.chunk_size() as usize;
    let mut current = Vec::with_capacity(chunk_size);
    let mut next = Vec::with_capacity(chunk_size);
    fill_chunk(&mut reader, &mut current, chunk_size)?;

    let mut index = 0u64;
    loop {
        cancel.check()?;

        // a short chunk is final, a full one is final only if nothing follows
        let is_final = current.len() < chunk_size || {
            fill_chunk(&mut reader, &mut next, chunk_size)?;
            next.is_empty()
        };

        let nonce = chunk_nonce(header.base_nonce(), index);
        let aad = chunk_aad(&header_bytes, index, is_final);
        let len = current.len() as u32;
        let tag = cipher.seal_in_place(&nonce, &aad, &mut current)?;

        writer.write_all(&[u8::from(is_final)])?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&current)?;
        writer.write_all(&tag)?;
        trace!(index, len, is_final, "sealed chunk");

        index += 1;
        if is_final {
            break;
        }
        std::mem::swap(&mut current, &mut next);
    }

    writer.flush()?;
    Ok(index)
}

/// Decrypt the chunk records following an already-read header.
///
/// `header_bytes` must be the exact bytes the header was parsed from.
/// Plaintext reaches `writer` chunk by chunk, so callers must discard the
/// output unless this returns `Ok`. Returns the number of chunks opened.
pub(crate) fn decrypt_stream<R: Read, W: Write>(
    cipher: &Cipher,
    header: &EnvelopeHeader,
    header_bytes: &[u8],
    mut reader: R,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<u64> {
    let chunk_size = header.chunk_size() as usize;
    let mut buf = Vec::with_capacity(chunk_size);
    let mut tag = [0u8; TAG_LEN];

    let mut index = 0u64;
    loop {
        cancel.check()?;

        let mut prefix = [0u8; FLAG_LEN + LEN_LEN];
        read_exact(&mut reader, &mut prefix, "chunk record; missing final chunk")?;

        let is_final = match prefix[0] {
            0 => false,
            1 => true,
            flag => return Err(malformed(format!("chunk {index} has invalid flag {flag}"))),
        };
        let len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
        if len > chunk_size {
            return Err(malformed(format!(
                "chunk {index} is {len} bytes, larger than the declared {chunk_size}"
            )));
        }

        buf.resize(len, 0);
        read_exact(&mut reader, &mut buf, "chunk")?;
        read_exact(&mut reader, &mut tag, "chunk tag")?;

        let nonce = chunk_nonce(header.base_nonce(), index);
        let aad = chunk_aad(header_bytes, index, is_final);
        cipher
            .open_in_place(&nonce, &aad, &mut buf, &tag)
            .map_err(|_| Error::ChunkAuthentication { index })?;

        writer.write_all(&buf)?;
        trace!(index, len, is_final, "opened chunk");

        index += 1;
        if is_final {
            break;
        }
    }

    let mut trailing = Vec::new();
    reader.take(1).read_to_end(&mut trailing)?;
    if !trailing.is_empty() {
        return Err(malformed("data after the final chunk"));
    }

    writer.flush()?;
    Ok(index)
}

/// Nonce for chunk `index`: the last 8 bytes of `base` XOR-ed with the
/// big-endian counter.
pub(crate) fn chunk_nonce(base: &[u8], index: u64) -> Vec<u8> {
    let mut nonce = base.to_vec();
    let offset = nonce.len().saturating_sub(COUNTER_LEN);
    for (byte, counter) in nonce[offset..].iter_mut().zip(index.to_be_bytes()) {
        *byte ^= counter;
    }
    nonce
}

fn chunk_aad(header_bytes: &[u8], index: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header_bytes.len() + COUNTER_LEN + FLAG_LEN);
    aad.extend_from_slice(header_bytes);
    aad.extend_from_slice(&index.to_le_bytes());
    aad.push(u8::from(is_final));
    aad
}

// Reads until `limit` bytes are buffered or the reader is exhausted.
fn fill_chunk<R: Read>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<()> {
    buf.clear();
    reader.take(limit as u64).read_to_end(buf)?;
    Ok(())
}
