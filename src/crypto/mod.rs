//! Cryptographic primitives for the key store and the encryption service.
//!
//! Provides the cipher strategies, key wrapping, passphrase key derivation
//! and the key store header.

pub mod aead;
pub mod algorithm;
pub mod cipher;
pub mod header;
pub mod kdf;

pub use aead::{KeyWrapper, generate_key_bytes, generate_nonce, generate_salt, secure_random};
pub use algorithm::EncryptionAlgorithm;
pub use cipher::{Cipher, Sealed};
pub use header::StoreHeader;
pub use kdf::{KdfParams, derive_key};

/// Length of every data key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
/// Length of the Argon2 salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Nonce length for AES-256-GCM and ChaCha20-Poly1305 (12 bytes).
pub const NONCE_LEN: usize = 12;
/// IV length for AES-256-CBC (one AES block).
pub const CBC_IV_LEN: usize = 16;
/// Authentication tag length for the AEAD schemes.
pub const TAG_LEN: usize = 16;
/// Nonce length for XChaCha20-Poly1305 key wrapping (24 bytes).
pub const WRAP_NONCE_LEN: usize = 24;
/// Length of the magic bytes (4 bytes).
pub const MAGIC_LEN: usize = 4;
/// Length of the version field (1 byte).
pub const VER_LEN: usize = 1;
/// Length of the memory cost field (4 bytes).
pub const MEM_LEN: usize = 4;
/// Length of the time cost field (4 bytes).
pub const TIME_LEN: usize = 4;
/// Length of the parallelism field (4 bytes).
pub const PAR_LEN: usize = 4;
