use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::Duration;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{EncryptionAlgorithm, KdfParams, KeyWrapper, StoreHeader};
use crate::error::{Error, Result};
use crate::key::{CryptoKey, KeyPurpose, KeyRecord, RECORD_EXTENSION};
use crate::storage::Storage;

/// Name of the passphrase header inside the key directory.
pub const HEADER_NAME: &str = "keystore.hdr";

/// How key bytes are protected at rest.
pub enum KeyProtection {
    /// Key bytes are wrapped under a key-encryption key derived from the
    /// passphrase with Argon2id.
    Passphrase {
        passphrase: Zeroizing<String>,
        kdf: KdfParams,
    },
    /// Key bytes are stored as base64 in owner-only files.
    Unprotected,
}

impl KeyProtection {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase {
            passphrase: Zeroizing::new(passphrase.into()),
            kdf: KdfParams::default(),
        }
    }
}

impl fmt::Debug for KeyProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase { kdf, .. } => f
                .debug_struct("Passphrase")
                .field("passphrase", &"<redacted>")
                .field("kdf", kdf)
                .finish(),
            Self::Unprotected => f.write_str("Unprotected"),
        }
    }
}

#[derive(Default)]
struct Keyring {
    keys: HashMap<String, CryptoKey>,
    active: HashMap<KeyPurpose, String>,
}

/// Durable set of keys and their activation state.
///
/// Lookups share a read lock. Generation, rotation and deactivation take the
/// write lock, persist every touched record, and only then swap the active
/// index, so readers never observe two active keys for one purpose.
pub struct KeyStore {
    storage: Storage,
    wrapper: Option<KeyWrapper>,
    default_algorithm: EncryptionAlgorithm,
    key_lifetime: Option<Duration>,
    state: RwLock<Keyring>,
}

impl KeyStore {
    /// Returns `true` if `storage` already holds a key store.
    pub fn exists(storage: &Storage) -> bool {
        storage.contains(HEADER_NAME)
            || storage
                .entries(RECORD_EXTENSION)
                .is_ok_and(|names| !names.is_empty())
    }

    /// Open the store in `storage`, creating it when empty.
    ///
    /// # Errors
    ///
    /// Fails on a wrong passphrase, when the protection mode does not match
    /// the existing store, or on I/O errors.
    pub fn open(storage: Storage, protection: KeyProtection) -> Result<Self> {
        let wrapper = match protection {
            KeyProtection::Passphrase { passphrase, kdf } => {
                Some(unlock_or_create(&storage, &passphrase, kdf)?)
            }
            KeyProtection::Unprotected => {
                if storage.contains(HEADER_NAME) {
                    return Err(Error::KeyStore(
                        "key store is passphrase-protected; a passphrase is required".into(),
                    ));
                }
                warn!(path = %storage.root().display(), "key store is not passphrase-protected");
                None
            }
        };

        let store = Self {
            storage,
            wrapper,
            default_algorithm: EncryptionAlgorithm::default(),
            key_lifetime: None,
            state: RwLock::new(Keyring::default()),
        };

        let keyring = store.load()?;
        *store.state.write() = keyring;
        Ok(store)
    }

    pub fn with_default_algorithm(mut self, algorithm: EncryptionAlgorithm) -> Self {
        self.default_algorithm = algorithm;
        self
    }

    /// Keys generated from now on expire `lifetime` after creation.
    pub fn with_key_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.key_lifetime = lifetime;
        self
    }

    pub fn default_algorithm(&self) -> EncryptionAlgorithm {
        self.default_algorithm
    }

    pub fn location(&self) -> &Path {
        self.storage.root()
    }

    pub fn is_protected(&self) -> bool {
        self.wrapper.is_some()
    }

    /// Generate a key and make it the active key for `purpose`.
    pub fn generate_key(&self, algorithm: EncryptionAlgorithm, purpose: KeyPurpose) -> Result<CryptoKey> {
        let key = CryptoKey::generate(algorithm, purpose, self.key_lifetime)?;

        let mut state = self.state.write();
        let previous = self.activate(&mut state, key.clone())?;

        info!(
            key_id = key.key_id(),
            algorithm = %algorithm,
            %purpose,
            previous = previous.as_deref().unwrap_or("-"),
            "generated key"
        );
        Ok(key)
    }

    /// Replace the active key for `purpose` with a fresh one of the same
    /// algorithm. The previous key stays available for decryption.
    pub fn rotate_key(&self, purpose: KeyPurpose) -> Result<CryptoKey> {
        let mut state = self.state.write();
        self.rotate_locked(&mut state, purpose)
    }

    /// Rotate the active key for `purpose` only if `due` holds for it.
    ///
    /// The check and the rotation happen under one write lock, so concurrent
    /// callers rotate a given key at most once. Returns `None` when there is
    /// no active key or it is not due.
    pub fn rotate_key_if(
        &self,
        purpose: KeyPurpose,
        due: impl FnOnce(&CryptoKey) -> bool,
    ) -> Result<Option<CryptoKey>> {
        let mut state = self.state.write();

        let Some(active) = state.active.get(&purpose).and_then(|id| state.keys.get(id)) else {
            return Ok(None);
        };
        if !due(active) {
            return Ok(None);
        }

        self.rotate_locked(&mut state, purpose).map(Some)
    }

    fn rotate_locked(&self, state: &mut Keyring, purpose: KeyPurpose) -> Result<CryptoKey> {
        let algorithm = state
            .active
            .get(&purpose)
            .and_then(|id| state.keys.get(id))
            .map_or(self.default_algorithm, CryptoKey::algorithm);

        let key = CryptoKey::generate(algorithm, purpose, self.key_lifetime)?;
        let previous = self.activate(state, key.clone())?;

        info!(
            key_id = key.key_id(),
            algorithm = %algorithm,
            %purpose,
            previous = previous.as_deref().unwrap_or("-"),
            "rotated key"
        );
        Ok(key)
    }

    /// Mark a key inactive. Returns `false` if the id is unknown.
    pub fn deactivate_key(&self, key_id: &str) -> Result<bool> {
        let mut state = self.state.write();

        let Some(key) = state.keys.get(key_id) else {
            return Ok(false);
        };
        if !key.is_active() {
            return Ok(true);
        }

        let mut key = key.clone();
        key.set_active(false);
        self.persist(&key)?;

        let purpose = key.purpose();
        if state.active.get(&purpose).is_some_and(|id| id == key_id) {
            state.active.remove(&purpose);
        }
        state.keys.insert(key_id.to_string(), key);

        info!(key_id, %purpose, "deactivated key");
        Ok(true)
    }

    pub fn get_active_key(&self, purpose: KeyPurpose) -> Option<CryptoKey> {
        let state = self.state.read();
        state
            .active
            .get(&purpose)
            .and_then(|id| state.keys.get(id))
            .cloned()
    }

    /// Look up a key by id, active or not.
    pub fn get_key(&self, key_id: &str) -> Option<CryptoKey> {
        self.state.read().keys.get(key_id).cloned()
    }

    /// All keys, oldest first.
    pub fn keys(&self) -> Vec<CryptoKey> {
        let mut keys: Vec<_> = self.state.read().keys.values().cloned().collect();
        keys.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.key_id().cmp(b.key_id()))
        });
        keys
    }

    pub fn key_count(&self) -> usize {
        self.state.read().keys.len()
    }

    pub fn active_key_count(&self) -> usize {
        self.state.read().active.len()
    }

    // Persist the new key, then the demoted previous holder, then swap the
    // index. A crash between the two writes leaves two active records, which
    // `load` repairs in favour of the newer key. A failed demotion removes
    // the new record again so disk and memory agree on the active key.
    fn activate(&self, state: &mut Keyring, key: CryptoKey) -> Result<Option<String>> {
        self.persist(&key)?;

        let purpose = key.purpose();
        let previous = state.active.get(&purpose).cloned();

        let demoted = previous.as_ref().and_then(|id| state.keys.get(id)).cloned();
        if let Some(mut old) = demoted {
            old.set_active(false);
            if let Err(err) = self.persist(&old) {
                self.discard(&key);
                return Err(err);
            }
            state.keys.insert(old.key_id().to_string(), old);
        }

        state.active.insert(purpose, key.key_id().to_string());
        state.keys.insert(key.key_id().to_string(), key);
        Ok(previous)
    }

    fn discard(&self, key: &CryptoKey) {
        if let Err(err) = self.storage.remove(&CryptoKey::record_name(key.key_id())) {
            warn!(key_id = key.key_id(), error = %err, "failed to remove abandoned key record");
        }
    }

    fn persist(&self, key: &CryptoKey) -> Result<()> {
        let record = key.to_record(self.wrapper.as_ref())?;
        let data = Zeroizing::new(serde_json::to_vec_pretty(&record)?);
        self.storage
            .save(&CryptoKey::record_name(key.key_id()), &data)
    }

    fn load(&self) -> Result<Keyring> {
        let mut keyring = Keyring::default();

        for name in self.storage.entries(RECORD_EXTENSION)? {
            match self.read_record(&name) {
                Ok(key) => {
                    keyring.keys.insert(key.key_id().to_string(), key);
                }
                Err(err) => warn!(record = %name, error = %err, "skipping unreadable key record"),
            }
        }

        for purpose in KeyPurpose::ALL {
            let mut active: Vec<&CryptoKey> = keyring
                .keys
                .values()
                .filter(|key| key.purpose() == purpose && key.is_active())
                .collect();
            active.sort_by(|a, b| {
                b.created_at()
                    .cmp(&a.created_at())
                    .then_with(|| b.key_id().cmp(a.key_id()))
            });

            let Some(winner) = active.first() else {
                continue;
            };
            let winner_id = winner.key_id().to_string();
            let stale: Vec<String> = active[1..]
                .iter()
                .map(|key| key.key_id().to_string())
                .collect();

            for key_id in stale {
                warn!(
                    key_id = %key_id,
                    active = %winner_id,
                    %purpose,
                    "more than one active key; deactivating older key"
                );
                if let Some(key) = keyring.keys.get_mut(&key_id) {
                    key.set_active(false);
                    self.persist(key)?;
                }
            }

            keyring.active.insert(purpose, winner_id);
        }

        debug!(
            path = %self.storage.root().display(),
            keys = keyring.keys.len(),
            "loaded key store"
        );
        Ok(keyring)
    }

    fn read_record(&self, name: &str) -> Result<CryptoKey> {
        let data = Zeroizing::new(self.storage.load(name)?);
        let record: KeyRecord = serde_json::from_slice(&data)?;
        let key = CryptoKey::from_record(record, self.wrapper.as_ref())?;

        if CryptoKey::record_name(key.key_id()) != name {
            return Err(Error::KeyStore(format!(
                "record holds key '{}'",
                key.key_id()
            )));
        }
        Ok(key)
    }
}

fn unlock_or_create(storage: &Storage, passphrase: &str, kdf: KdfParams) -> Result<KeyWrapper> {
    if storage.contains(HEADER_NAME) {
        let header = StoreHeader::from_bytes(&storage.load(HEADER_NAME)?)?;
        let kek = header.unlock(passphrase)?;
        return Ok(KeyWrapper::new(&kek));
    }

    if KeyStore::exists(storage) {
        return Err(Error::KeyStore(
            "key store is not passphrase-protected; open it unprotected".into(),
        ));
    }

    let (header, kek) = StoreHeader::create(passphrase, kdf)?;
    storage.save(HEADER_NAME, &header.to_bytes())?;
    info!(path = %storage.root().display(), "created passphrase-protected key store");
    Ok(KeyWrapper::new(&kek))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn cheap_passphrase(passphrase: &str) -> KeyProtection {
        KeyProtection::Passphrase {
            passphrase: Zeroizing::new(passphrase.to_string()),
            kdf: KdfParams::new(1024, 1, 1).unwrap(),
        }
    }

    fn open(dir: &Path) -> KeyStore {
        KeyStore::open(Storage::new(dir), KeyProtection::Unprotected).unwrap()
    }

    #[test]
    fn new_store_is_empty() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        assert_eq!(store.key_count(), 0);
        assert!(store.get_active_key(KeyPurpose::Encryption).is_none());
        assert!(!KeyStore::exists(&Storage::new(dir.path())));
    }

    #[test]
    fn generate_key_becomes_active() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let key = store
            .generate_key(EncryptionAlgorithm::ChaCha20Poly1305, KeyPurpose::Encryption)
            .unwrap();

        let active = store.get_active_key(KeyPurpose::Encryption).unwrap();
        assert_eq!(active.key_id(), key.key_id());
        assert_eq!(active.algorithm(), EncryptionAlgorithm::ChaCha20Poly1305);
        assert!(store.get_active_key(KeyPurpose::Signature).is_none());
        assert!(dir.path().join(format!("{}.key", key.key_id())).exists());
    }

    #[test]
    fn generate_key_deactivates_previous_holder() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let first = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();
        let second = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();

        assert!(!store.get_key(first.key_id()).unwrap().is_active());
        assert!(store.get_key(second.key_id()).unwrap().is_active());
        assert_eq!(store.active_key_count(), 1);
    }

    #[test]
    fn rotate_key_if_checks_the_current_active_key() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let first = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();

        let skipped = store
            .rotate_key_if(KeyPurpose::Encryption, |_| false)
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(store.key_count(), 1);

        let first_id = first.key_id().to_string();
        let rotated = store
            .rotate_key_if(KeyPurpose::Encryption, |key| key.key_id() == first_id)
            .unwrap()
            .unwrap();
        assert_ne!(rotated.key_id(), first.key_id());

        // The replacement no longer matches, so a second call is a no-op.
        let again = store
            .rotate_key_if(KeyPurpose::Encryption, |key| key.key_id() == first_id)
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.key_count(), 2);

        assert!(store
            .rotate_key_if(KeyPurpose::Signature, |_| true)
            .unwrap()
            .is_none());
    }

    #[cfg(unix)]
    #[test]
    fn failed_demotion_leaves_previous_key_active() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let first = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();

        // A non-empty directory at the record path makes the rename fail.
        let record = dir.path().join(format!("{}.key", first.key_id()));
        fs::remove_file(&record).unwrap();
        fs::create_dir(&record).unwrap();
        fs::write(record.join("blocker"), b"x").unwrap();

        assert!(store.rotate_key(KeyPurpose::Encryption).is_err());

        let active = store.get_active_key(KeyPurpose::Encryption).unwrap();
        assert_eq!(active.key_id(), first.key_id());
        assert_eq!(store.key_count(), 1);

        let records: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "key"))
            .collect();
        assert!(records.is_empty(), "unexpected records: {records:?}");
    }

    #[test]
    fn rotate_keeps_algorithm_and_old_key() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let old = store
            .generate_key(EncryptionAlgorithm::Aes256Cbc, KeyPurpose::Signature)
            .unwrap();
        let new = store.rotate_key(KeyPurpose::Signature).unwrap();

        assert_ne!(old.key_id(), new.key_id());
        assert_eq!(new.algorithm(), EncryptionAlgorithm::Aes256Cbc);

        let retained = store.get_key(old.key_id()).unwrap();
        assert!(!retained.is_active());
        assert_eq!(retained.key_bytes(), old.key_bytes());
    }

    #[test]
    fn rotate_without_active_key_uses_default_algorithm() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).with_default_algorithm(EncryptionAlgorithm::ChaCha20Poly1305);

        let key = store.rotate_key(KeyPurpose::Encryption).unwrap();
        assert_eq!(key.algorithm(), EncryptionAlgorithm::ChaCha20Poly1305);
    }

    #[test]
    fn deactivate_key_works() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let key = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();

        assert!(store.deactivate_key(key.key_id()).unwrap());
        assert!(store.get_active_key(KeyPurpose::Encryption).is_none());
        assert!(store.get_key(key.key_id()).is_some());

        // idempotent
        assert!(store.deactivate_key(key.key_id()).unwrap());
    }

    #[test]
    fn deactivate_unknown_key_returns_false() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        assert!(!store.deactivate_key("encryption_0000").unwrap());
    }

    #[test]
    fn snapshots_do_not_follow_store_changes() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let key = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();

        store.deactivate_key(key.key_id()).unwrap();
        assert!(key.is_active());
    }

    #[test]
    fn keys_are_listed_oldest_first() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let a = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();
        let b = store.rotate_key(KeyPurpose::Encryption).unwrap();

        let ids: Vec<_> = store.keys().iter().map(|k| k.key_id().to_string()).collect();
        assert_eq!(ids, vec![a.key_id().to_string(), b.key_id().to_string()]);
    }

    #[test]
    fn reopen_restores_identical_keys() {
        let dir = tempdir().unwrap();

        let (old, new) = {
            let store = open(dir.path());
            let old = store
                .generate_key(EncryptionAlgorithm::ChaCha20Poly1305, KeyPurpose::Encryption)
                .unwrap();
            let new = store.rotate_key(KeyPurpose::Encryption).unwrap();
            (old, new)
        };

        let store = open(dir.path());
        assert_eq!(store.key_count(), 2);

        let restored_old = store.get_key(old.key_id()).unwrap();
        assert_eq!(restored_old.key_bytes(), old.key_bytes());
        assert!(!restored_old.is_active());

        let active = store.get_active_key(KeyPurpose::Encryption).unwrap();
        assert_eq!(active.key_id(), new.key_id());
        assert_eq!(active.key_bytes(), new.key_bytes());
        assert_eq!(active.algorithm(), EncryptionAlgorithm::ChaCha20Poly1305);
    }

    #[test]
    fn load_repairs_duplicate_active_keys() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());

        // simulate a crash between the two writes of a rotation
        let older = CryptoKey::generate(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption, None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = CryptoKey::generate(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption, None)
            .unwrap();
        for key in [&older, &newer] {
            let record = serde_json::to_vec(&key.to_record(None).unwrap()).unwrap();
            storage.save(&CryptoKey::record_name(key.key_id()), &record).unwrap();
        }

        let store = open(dir.path());
        assert_eq!(
            store.get_active_key(KeyPurpose::Encryption).unwrap().key_id(),
            newer.key_id()
        );
        assert!(!store.get_key(older.key_id()).unwrap().is_active());

        // the repair is persisted
        let store = open(dir.path());
        assert!(!store.get_key(older.key_id()).unwrap().is_active());
    }

    #[test]
    fn malformed_records_are_skipped() {
        let dir = tempdir().unwrap();
        let key_id = {
            let store = open(dir.path());
            store
                .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
                .unwrap()
                .key_id()
                .to_string()
        };
        fs::write(dir.path().join("encryption_ffff.key"), b"{not json").unwrap();

        let store = open(dir.path());
        assert_eq!(store.key_count(), 1);
        assert!(store.get_key(&key_id).is_some());
    }

    #[test]
    fn renamed_record_is_skipped() {
        let dir = tempdir().unwrap();
        let key_id = {
            let store = open(dir.path());
            store
                .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
                .unwrap()
                .key_id()
                .to_string()
        };
        fs::rename(
            dir.path().join(format!("{key_id}.key")),
            dir.path().join("encryption_abcd.key"),
        )
        .unwrap();

        assert_eq!(open(dir.path()).key_count(), 0);
    }

    #[test]
    fn passphrase_store_roundtrip() {
        let dir = tempdir().unwrap();

        let key = {
            let store = KeyStore::open(Storage::new(dir.path()), cheap_passphrase("pw")).unwrap();
            assert!(store.is_protected());
            store
                .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
                .unwrap()
        };

        let record = fs::read_to_string(dir.path().join(format!("{}.key", key.key_id()))).unwrap();
        assert!(record.contains("\"wrapped\""));

        let store = KeyStore::open(Storage::new(dir.path()), cheap_passphrase("pw")).unwrap();
        assert_eq!(
            store.get_key(key.key_id()).unwrap().key_bytes(),
            key.key_bytes()
        );
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        KeyStore::open(Storage::new(dir.path()), cheap_passphrase("correct")).unwrap();

        assert!(KeyStore::open(Storage::new(dir.path()), cheap_passphrase("wrong")).is_err());
    }

    #[test]
    fn protected_store_requires_passphrase() {
        let dir = tempdir().unwrap();
        KeyStore::open(Storage::new(dir.path()), cheap_passphrase("pw")).unwrap();

        assert!(KeyStore::exists(&Storage::new(dir.path())));
        assert!(KeyStore::open(Storage::new(dir.path()), KeyProtection::Unprotected).is_err());
    }

    #[test]
    fn unprotected_store_rejects_passphrase() {
        let dir = tempdir().unwrap();
        open(dir.path())
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();

        assert!(KeyStore::open(Storage::new(dir.path()), cheap_passphrase("pw")).is_err());
    }

    #[test]
    fn lifetime_is_applied_to_generated_keys() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).with_key_lifetime(Some(Duration::days(90)));

        let key = store
            .generate_key(EncryptionAlgorithm::Aes256Gcm, KeyPurpose::Encryption)
            .unwrap();
        assert_eq!(key.expires_at().unwrap() - key.created_at(), Duration::days(90));
    }

    #[test]
    fn debug_hides_passphrase() {
        let printed = format!("{:?}", KeyProtection::passphrase("hunter2"));
        assert!(!printed.contains("hunter2"));
    }
}
