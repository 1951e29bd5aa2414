use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::KEY_LEN;
use crate::error::{Error, Result};

/// Argon2id cost parameters for deriving the key-encryption key.
///
/// Stored in the key store header, so a store keeps opening with the
/// parameters it was created with even if the defaults change later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024, // 64 MiB
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_cost < 1 {
            return Err(Error::KeyDerivation("argon2 time cost must be >= 1".into()));
        }
        if self.parallelism < 1 {
            return Err(Error::KeyDerivation("argon2 parallelism must be >= 1".into()));
        }
        if self.mem_cost_kib < 8 * self.parallelism {
            return Err(Error::KeyDerivation(
                "argon2 memory cost must be at least 8 KiB * parallelism".into(),
            ));
        }
        Ok(())
    }
}

/// Derive the key-encryption key from a passphrase.
pub fn derive_key(passphrase: &str, salt: &[u8], kdf: KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    kdf.validate()?;

    let params = Params::new(kdf.mem_cost_kib, kdf.time_cost, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| Error::KeyDerivation(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    Ok(key)
}
