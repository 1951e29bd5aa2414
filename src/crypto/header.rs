//! Header of a passphrase-protected key store.
//!
//! ```text
//! MAGIC (4) | VERSION (1) | MEM_COST (4) | TIME_COST (4) | PARALLELISM (4) | SALT (16) | CHECK_NONCE (24) | CHECK
//! ```
//!
//! `CHECK` is a fixed value sealed under the key-encryption key. Opening it
//! proves the passphrase before any key record is touched.

use super::aead::{open_check, seal_check};
use super::kdf::{KdfParams, derive_key};
use super::{KEY_LEN, MAGIC_LEN, MEM_LEN, PAR_LEN, SALT_LEN, TIME_LEN, VER_LEN, WRAP_NONCE_LEN};
use crate::crypto::generate_salt;
use crate::error::{Error, Result};
use zeroize::Zeroizing;

pub const VERSION_V1: u8 = 1;
pub const MAGIC: &[u8; MAGIC_LEN] = b"KWKS";

const CHECK_VALUE: &[u8] = b"keyward key store";

#[derive(Debug)]
pub struct StoreHeader {
    version: u8,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    check_nonce: [u8; WRAP_NONCE_LEN],
    check: Vec<u8>,
}

impl StoreHeader {
    /// Length of the fixed part, before the sealed check value.
    pub const FIXED_LEN: usize =
        MAGIC_LEN + VER_LEN + MEM_LEN + TIME_LEN + PAR_LEN + SALT_LEN + WRAP_NONCE_LEN;

    /// Create a header for a new store and return it with the derived KEK.
    pub fn create(passphrase: &str, kdf: KdfParams) -> Result<(Self, Zeroizing<[u8; KEY_LEN]>)> {
        let salt = generate_salt()?;
        let kek = derive_key(passphrase, &salt, kdf)?;
        let (check_nonce, check) = seal_check(&kek, CHECK_VALUE)?;

        let header = Self {
            version: VERSION_V1,
            kdf,
            salt,
            check_nonce,
            check,
        };
        Ok((header, kek))
    }

    /// Derive the KEK from `passphrase` and confirm it against the check value.
    pub fn unlock(&self, passphrase: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let kek = derive_key(passphrase, &self.salt, self.kdf)?;

        match open_check(&kek, &self.check_nonce, &self.check) {
            Ok(value) if value.as_slice() == CHECK_VALUE => Ok(kek),
            _ => Err(Error::KeyStore(
                "wrong passphrase or corrupted key store header".into(),
            )),
        }
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_LEN + self.check.len());

        buf.extend_from_slice(MAGIC);
        buf.push(self.version);

        buf.extend_from_slice(&self.kdf.mem_cost_kib().to_le_bytes());
        buf.extend_from_slice(&self.kdf.time_cost().to_le_bytes());
        buf.extend_from_slice(&self.kdf.parallelism().to_le_bytes());

        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.check_nonce);
        buf.extend_from_slice(&self.check);

        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() <= Self::FIXED_LEN {
            return Err(malformed("key store header too short"));
        }

        if &data[..MAGIC_LEN] != MAGIC {
            return Err(malformed("invalid key store header"));
        }

        let version = data[MAGIC_LEN];
        if version != VERSION_V1 {
            return Err(malformed(&format!("unsupported key store version: {version}")));
        }

        let mut offset = MAGIC_LEN + VER_LEN;
        let mem_cost_kib = read_u32(data, &mut offset);
        let time_cost = read_u32(data, &mut offset);
        let parallelism = read_u32(data, &mut offset);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[offset..offset + SALT_LEN]);
        offset += SALT_LEN;

        let mut check_nonce = [0u8; WRAP_NONCE_LEN];
        check_nonce.copy_from_slice(&data[offset..offset + WRAP_NONCE_LEN]);
        offset += WRAP_NONCE_LEN;

        Ok(StoreHeader {
            version,
            kdf: KdfParams::new(mem_cost_kib, time_cost, parallelism)?,
            salt,
            check_nonce,
            check: data[offset..].to_vec(),
        })
    }
}

// Callers check the total length first.
fn read_u32(data: &[u8], offset: &mut usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    u32::from_le_bytes(bytes)
}

fn malformed(reason: &str) -> Error {
    Error::KeyStore(reason.to_string())
}
