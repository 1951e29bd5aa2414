//! Cipher strategies.
//!
//! One variant per [`EncryptionAlgorithm`], all behind the same seal/open
//! contract. The variant is chosen once, when the key is bound, and every
//! later call dispatches on it.
//!
//! AES-256-GCM and ChaCha20-Poly1305 verify the tag before any plaintext is
//! released; the comparison is constant-time inside the RustCrypto AEAD
//! implementations. AES-256-CBC has no tag: `open` only strips PKCS#7
//! padding, so a tampered CBC ciphertext usually decrypts to garbage instead
//! of failing. A padding error is the only failure CBC can report.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroizing;

use super::{EncryptionAlgorithm, KEY_LEN, TAG_LEN};
use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_LEN: usize = 16;

/// Output of [`Cipher::seal`]. `tag` is empty for CBC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

pub enum Cipher {
    Aes256Gcm(Box<Aes256Gcm>),
    Aes256Cbc(Zeroizing<[u8; KEY_LEN]>),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl Cipher {
    /// Bind `key` to the strategy for `algorithm`.
    pub fn new(algorithm: EncryptionAlgorithm, key: &[u8]) -> Result<Self> {
        if key.len() != algorithm.key_len() {
            return Err(Error::InvalidKeyLength {
                expected: algorithm.key_len(),
                got: key.len(),
            });
        }

        Ok(match algorithm {
            EncryptionAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| invalid_key(key))?;
                Self::Aes256Gcm(Box::new(cipher))
            }
            EncryptionAlgorithm::Aes256Cbc => {
                let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
                bytes.copy_from_slice(key);
                Self::Aes256Cbc(bytes)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| invalid_key(key))?;
                Self::ChaCha20Poly1305(cipher)
            }
        })
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        match self {
            Self::Aes256Gcm(_) => EncryptionAlgorithm::Aes256Gcm,
            Self::Aes256Cbc(_) => EncryptionAlgorithm::Aes256Cbc,
            Self::ChaCha20Poly1305(_) => EncryptionAlgorithm::ChaCha20Poly1305,
        }
    }

    /// Encrypt a copy of `plaintext`.
    pub fn seal(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
        let mut buf = Vec::with_capacity(plaintext.len() + AES_BLOCK_LEN);
        buf.extend_from_slice(plaintext);
        let tag = self.seal_in_place(nonce, aad, &mut buf)?;
        Ok(Sealed {
            ciphertext: buf,
            tag,
        })
    }

    /// Encrypt `buf` in place and return the detached tag.
    ///
    /// CBC grows `buf` by up to one block of padding; reserve capacity
    /// up front to avoid a reallocation.
    pub fn seal_in_place(&self, nonce: &[u8], aad: &[u8], buf: &mut Vec<u8>) -> Result<Vec<u8>> {
        self.check_nonce(nonce)?;

        match self {
            Self::Aes256Gcm(cipher) => aead_seal(cipher.as_ref(), nonce, aad, buf),
            Self::ChaCha20Poly1305(cipher) => aead_seal(cipher, nonce, aad, buf),
            Self::Aes256Cbc(key) => {
                let msg_len = buf.len();
                buf.resize((msg_len / AES_BLOCK_LEN + 1) * AES_BLOCK_LEN, 0);

                let sealed_len = Aes256CbcEnc::new_from_slices(key.as_slice(), nonce)
                    .map_err(|_| Error::Encryption("invalid CBC key or IV".into()))?
                    .encrypt_padded_mut::<Pkcs7>(buf, msg_len)
                    .map_err(|_| Error::Encryption("CBC padding failed".into()))?
                    .len();
                buf.truncate(sealed_len);

                Ok(Vec::new())
            }
        }
    }

    /// Decrypt a copy of `ciphertext`.
    pub fn open(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(ciphertext.to_vec());
        self.open_in_place(nonce, aad, &mut buf, tag)?;
        Ok(buf)
    }

    /// Decrypt `buf` in place.
    ///
    /// Returns [`Error::AuthenticationFailure`] when the tag does not verify
    /// (AEAD) or the padding is invalid (CBC). The contents of `buf` are
    /// unspecified after a failure and must be discarded.
    pub fn open_in_place(&self, nonce: &[u8], aad: &[u8], buf: &mut Vec<u8>, tag: &[u8]) -> Result<()> {
        self.check_nonce(nonce)?;

        match self {
            Self::Aes256Gcm(cipher) => aead_open(cipher.as_ref(), nonce, aad, buf, tag),
            Self::ChaCha20Poly1305(cipher) => aead_open(cipher, nonce, aad, buf, tag),
            Self::Aes256Cbc(key) => {
                if !tag.is_empty() || buf.is_empty() || buf.len() % AES_BLOCK_LEN != 0 {
                    return Err(Error::AuthenticationFailure);
                }

                let opened_len = Aes256CbcDec::new_from_slices(key.as_slice(), nonce)
                    .map_err(|_| Error::Encryption("invalid CBC key or IV".into()))?
                    .decrypt_padded_mut::<Pkcs7>(buf)
                    .map_err(|_| Error::AuthenticationFailure)?
                    .len();
                buf.truncate(opened_len);

                Ok(())
            }
        }
    }

    fn check_nonce(&self, nonce: &[u8]) -> Result<()> {
        let expected = self.algorithm().nonce_len();
        if nonce.len() != expected {
            return Err(Error::InvalidNonceLength {
                expected,
                got: nonce.len(),
            });
        }
        Ok(())
    }
}

fn invalid_key(key: &[u8]) -> Error {
    Error::InvalidKeyLength {
        expected: KEY_LEN,
        got: key.len(),
    }
}

fn aead_seal<A: AeadInPlace>(cipher: &A, nonce: &[u8], aad: &[u8], buf: &mut [u8]) -> Result<Vec<u8>> {
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<A>::from_slice(nonce), aad, buf)
        .map_err(|_| Error::Encryption("AEAD seal failed".into()))?;
    Ok(tag.to_vec())
}

fn aead_open<A: AeadInPlace>(
    cipher: &A,
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8],
) -> Result<()> {
    if tag.len() != TAG_LEN {
        return Err(Error::AuthenticationFailure);
    }

    cipher
        .decrypt_in_place_detached(Nonce::<A>::from_slice(nonce), aad, buf, Tag::<A>::from_slice(tag))
        .map_err(|_| Error::AuthenticationFailure)
}
