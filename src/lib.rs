//! Key store and authenticated encryption service.
//!
//! [`EncryptionService`] owns a [`KeyStore`] and encrypts payloads and
//! files with AES-256-GCM, ChaCha20-Poly1305 or AES-256-CBC. Keys are
//! rotated without discarding old ones, so earlier ciphertexts stay
//! decryptable.

pub mod codec;
pub mod config;
pub mod crypto;
mod encoding;
mod error;
pub mod format;
mod key;
mod service;
mod storage;
mod store;

pub use crate::codec::CancelToken;
pub use crate::config::{RotationPolicy, ServiceConfig};
pub use crate::crypto::{Cipher, EncryptionAlgorithm, KdfParams, Sealed};
pub use crate::error::{Error, Result};
pub use crate::key::{CryptoKey, KeyPurpose};
pub use crate::service::{
    DecryptionResult, EncryptionResult, EncryptionService, EncryptionStats, Metadata,
};
pub use crate::storage::Storage;
pub use crate::store::{HEADER_NAME, KeyProtection, KeyStore};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Platform data directory for keys, e.g. `~/.local/share/keyward/keys`.
pub fn default_key_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "keyward")
        .ok_or_else(|| Error::Config("could not determine platform directories".into()))?;

    Ok(project_dirs.data_dir().join("keys"))
}
