use super::{KEY_LEN, SALT_LEN, WRAP_NONCE_LEN};
use crate::error::{Error, Result};
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use getrandom::fill;
use zeroize::Zeroizing;

/// Fill buffer with cryptographically secure random bytes
pub fn secure_random(buf: &mut [u8]) -> Result<()> {
    fill(buf).map_err(|_| Error::Random)
}

/// Generate salt
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    secure_random(&mut salt)?;
    Ok(salt)
}

/// Generate a fresh data key
pub fn generate_key_bytes() -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    secure_random(&mut key[..])?;
    Ok(key)
}

/// Generate a random nonce of `len` bytes
pub fn generate_nonce(len: usize) -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; len];
    secure_random(&mut nonce)?;
    Ok(nonce)
}

/// Seals stored key bytes under a key-encryption key.
///
/// Uses XChaCha20-Poly1305 so the 24-byte nonce can be drawn at random for
/// every record without tracking counters. The key id is bound as associated
/// data, which stops a wrapped key from being replayed under another id.
pub struct KeyWrapper {
    cipher: XChaCha20Poly1305,
}

impl KeyWrapper {
    pub fn new(kek: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(kek)),
        }
    }

    /// Wrap key bytes, returning `(nonce, ciphertext)`.
    pub fn wrap(&self, key_id: &str, key: &[u8]) -> Result<([u8; WRAP_NONCE_LEN], Vec<u8>)> {
        let mut nonce = [0u8; WRAP_NONCE_LEN];
        secure_random(&mut nonce)?;

        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: key,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| Error::Encryption("key wrapping failed".into()))?;

        Ok((nonce, ciphertext))
    }

    pub fn unwrap(&self, key_id: &str, nonce: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if nonce.len() != WRAP_NONCE_LEN {
            return Err(Error::InvalidNonceLength {
                expected: WRAP_NONCE_LEN,
                got: nonce.len(),
            });
        }

        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| Error::AuthenticationFailure)?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Seal a fixed check value so a wrong passphrase is caught at open time.
pub(crate) fn seal_check(kek: &[u8; KEY_LEN], check: &[u8]) -> Result<([u8; WRAP_NONCE_LEN], Vec<u8>)> {
    KeyWrapper::new(kek).wrap("keystore-check", check)
}

pub(crate) fn open_check(kek: &[u8; KEY_LEN], nonce: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    KeyWrapper::new(kek).unwrap("keystore-check", nonce, sealed)
}
