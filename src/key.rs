use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{Cipher, EncryptionAlgorithm, KEY_LEN, KeyWrapper, generate_key_bytes, secure_random};
use crate::error::{Error, Result};

/// Current layout of a persisted key record.
pub(crate) const RECORD_VERSION: u8 = 1;

/// Extension of key record files inside the key directory.
pub(crate) const RECORD_EXTENSION: &str = "key";

/// Partition of the key space. Rotation and active-key lookups are scoped
/// to a single purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    Encryption,
    Signature,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 2] = [KeyPurpose::Encryption, KeyPurpose::Signature];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Encryption => "encryption",
            Self::Signature => "signature",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyPurpose {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|purpose| purpose.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownPurpose(s.to_string()))
    }
}

/// A symmetric key owned by the [`KeyStore`](crate::KeyStore).
///
/// Values handed out by the store are snapshots: flipping `is_active` on
/// the store is not reflected in a copy obtained earlier. Key bytes are
/// wiped on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct CryptoKey {
    key_id: String,
    algorithm: EncryptionAlgorithm,
    purpose: KeyPurpose,
    key_bytes: Zeroizing<[u8; KEY_LEN]>,
    is_active: bool,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl CryptoKey {
    pub(crate) fn generate(
        algorithm: EncryptionAlgorithm,
        purpose: KeyPurpose,
        lifetime: Option<Duration>,
    ) -> Result<Self> {
        let mut suffix = [0u8; 8];
        secure_random(&mut suffix)?;

        let created_at = Utc::now();
        Ok(Self {
            key_id: format!("{purpose}_{}", hex::encode(suffix)),
            algorithm,
            purpose,
            key_bytes: generate_key_bytes()?,
            is_active: true,
            created_at,
            expires_at: lifetime.map(|lifetime| created_at + lifetime),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    pub fn key_bytes(&self) -> &[u8] {
        self.key_bytes.as_slice()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Bind this key's bytes to the strategy for `algorithm`.
    pub fn cipher(&self, algorithm: EncryptionAlgorithm) -> Result<Cipher> {
        Cipher::new(algorithm, self.key_bytes())
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    pub(crate) fn record_name(key_id: &str) -> String {
        format!("{key_id}.{RECORD_EXTENSION}")
    }

    pub(crate) fn to_record(&self, wrapper: Option<&KeyWrapper>) -> Result<KeyRecord> {
        let material = match wrapper {
            Some(wrapper) => {
                let (nonce, ciphertext) = wrapper.wrap(&self.key_id, self.key_bytes())?;
                KeyMaterial::Wrapped {
                    nonce: nonce.to_vec(),
                    ciphertext,
                }
            }
            None => KeyMaterial::Plain {
                key: Zeroizing::new(self.key_bytes().to_vec()),
            },
        };

        Ok(KeyRecord {
            version: RECORD_VERSION,
            key_id: self.key_id.clone(),
            algorithm: self.algorithm,
            purpose: self.purpose,
            is_active: self.is_active,
            created_at: self.created_at,
            expires_at: self.expires_at,
            material,
        })
    }

    pub(crate) fn from_record(record: KeyRecord, wrapper: Option<&KeyWrapper>) -> Result<Self> {
        if record.version != RECORD_VERSION {
            return Err(Error::KeyStore(format!(
                "unsupported key record version {}",
                record.version
            )));
        }

        if !is_valid_key_id(&record.key_id, record.purpose) {
            return Err(Error::KeyStore(format!("invalid key id '{}'", record.key_id)));
        }

        let raw = match (record.material, wrapper) {
            (KeyMaterial::Plain { key }, _) => key,
            (KeyMaterial::Wrapped { nonce, ciphertext }, Some(wrapper)) => {
                wrapper.unwrap(&record.key_id, &nonce, &ciphertext)?
            }
            (KeyMaterial::Wrapped { .. }, None) => {
                return Err(Error::KeyStore(
                    "key record is wrapped but no passphrase was supplied".into(),
                ));
            }
        };

        if raw.len() != KEY_LEN {
            return Err(Error::InvalidKeyLength {
                expected: KEY_LEN,
                got: raw.len(),
            });
        }

        let mut key_bytes = Zeroizing::new([0u8; KEY_LEN]);
        key_bytes.copy_from_slice(&raw);

        Ok(Self {
            key_id: record.key_id,
            algorithm: record.algorithm,
            purpose: record.purpose,
            key_bytes,
            is_active: record.is_active,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("purpose", &self.purpose)
            .field("key_bytes", &"<redacted>")
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// Ids double as file names, so only `<purpose>_<hex>` is accepted.
fn is_valid_key_id(key_id: &str, purpose: KeyPurpose) -> bool {
    key_id
        .strip_prefix(purpose.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Persisted form of a [`CryptoKey`], one JSON document per key.
#[derive(Serialize, Deserialize)]
pub(crate) struct KeyRecord {
    version: u8,
    key_id: String,
    algorithm: EncryptionAlgorithm,
    purpose: KeyPurpose,
    is_active: bool,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    material: KeyMaterial,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
enum KeyMaterial {
    Plain {
        #[serde(with = "crate::encoding")]
        key: Zeroizing<Vec<u8>>,
    },
    Wrapped {
        #[serde(with = "crate::encoding")]
        nonce: Vec<u8>,
        #[serde(with = "crate::encoding")]
        ciphertext: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_purpose_prefix_and_full_length() {
        let key = CryptoKey::generate(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption, None)
            .unwrap();

        assert!(key.key_id().starts_with("encryption_"));
        assert_eq!(key.key_id().len(), "encryption_".len() + 16);
        assert_eq!(key.key_bytes().len(), 32);
        assert!(key.is_active());
        assert_eq!(key.expires_at(), None);
    }

    #[test]
    fn lifetime_sets_expiry() {
        let key = CryptoKey::generate(
            EncryptionAlgorithm::ChaCha20Poly1305,
            KeyPurpose::Signature,
            Some(Duration::days(90)),
        )
        .unwrap();

        let expires_at = key.expires_at().unwrap();
        assert_eq!(expires_at - key.created_at(), Duration::days(90));
        assert!(!key.is_expired(key.created_at()));
        assert!(key.is_expired(expires_at));
    }

    #[test]
    fn debug_redacts_key_bytes() {
        let key = CryptoKey::generate(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption, None)
            .unwrap();
        let printed = format!("{key:?}");

        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains(&format!("{:?}", key.key_bytes())));
    }

    #[test]
    fn plain_record_roundtrip() {
        let key = CryptoKey::generate(EncryptionAlgorithm::Aes256Cbc, KeyPurpose::Signature, None)
            .unwrap();

        let json = serde_json::to_vec(&key.to_record(None).unwrap()).unwrap();
        let restored = CryptoKey::from_record(serde_json::from_slice(&json).unwrap(), None).unwrap();

        assert_eq!(restored.key_id(), key.key_id());
        assert_eq!(restored.key_bytes(), key.key_bytes());
        assert_eq!(restored.algorithm(), key.algorithm());
        assert_eq!(restored.purpose(), key.purpose());
        assert_eq!(restored.created_at(), key.created_at());
    }

    #[test]
    fn wrapped_record_hides_key_bytes() {
        let wrapper = KeyWrapper::new(&[5u8; KEY_LEN]);
        let key = CryptoKey::generate(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption, None)
            .unwrap();

        let json = serde_json::to_string(&key.to_record(Some(&wrapper)).unwrap()).unwrap();
        assert!(json.contains("\"scheme\":\"wrapped\""));

        let record: KeyRecord = serde_json::from_str(&json).unwrap();
        assert!(CryptoKey::from_record(record, None).is_err());

        let record: KeyRecord = serde_json::from_str(&json).unwrap();
        let restored = CryptoKey::from_record(record, Some(&wrapper)).unwrap();
        assert_eq!(restored.key_bytes(), key.key_bytes());
    }

    #[test]
    fn key_id_validation() {
        assert!(is_valid_key_id("encryption_0a1b", KeyPurpose::Encryption));
        assert!(!is_valid_key_id("encryption_0a1b", KeyPurpose::Signature));
        assert!(!is_valid_key_id("encryption_", KeyPurpose::Encryption));
        assert!(!is_valid_key_id("encryption_../../etc", KeyPurpose::Encryption));
    }

    #[test]
    fn purpose_parses_from_str() {
        assert_eq!("Encryption".parse::<KeyPurpose>().unwrap(), KeyPurpose::Encryption);
        assert!("master".parse::<KeyPurpose>().is_err());
    }
}
