use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::codec::{self, CancelToken};
use crate::config::ServiceConfig;
use crate::crypto::{CBC_IV_LEN, EncryptionAlgorithm, generate_nonce};
use crate::error::{Error, Result};
use crate::format::{self, EnvelopeHeader};
use crate::key::{CryptoKey, KeyPurpose};
use crate::storage::{PendingFile, Storage};
use crate::store::{KeyProtection, KeyStore};

/// Caller-supplied labels carried through encryption unmodified.
pub type Metadata = BTreeMap<String, String>;

const ENCRYPTED_SUFFIX: &str = ".encrypted";
const DECRYPTED_SUFFIX: &str = ".decrypted";

/// Self-describing output of [`EncryptionService::encrypt_data`].
///
/// Serializes with byte fields as base64 so it can be stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionResult {
    #[serde(with = "crate::encoding")]
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub algorithm: EncryptionAlgorithm,
    #[serde(with = "crate::encoding")]
    pub iv_or_nonce: Vec<u8>,
    /// Empty for CBC.
    #[serde(with = "crate::encoding")]
    pub tag: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Output of [`EncryptionService::decrypt_data`].
///
/// When `verified` is `false` the plaintext is empty.
#[derive(Clone)]
pub struct DecryptionResult {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub verified: bool,
    pub metadata: Metadata,
}

impl fmt::Debug for DecryptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionResult")
            .field("plaintext", &format_args!("<{} bytes>", self.plaintext.len()))
            .field("verified", &self.verified)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Snapshot of the service counters and key state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptionStats {
    pub encryption_operations: u64,
    pub decryption_operations: u64,
    pub key_rotations: u64,
    pub failed_operations: u64,
    pub active_keys: usize,
    pub active_encryption_keys: usize,
    pub total_keys: usize,
    pub default_algorithm: EncryptionAlgorithm,
    pub keystore_path: PathBuf,
}

#[derive(Default)]
struct Counters {
    encryption_operations: AtomicU64,
    decryption_operations: AtomicU64,
    key_rotations: AtomicU64,
    failed_operations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Encrypts and decrypts payloads and files with keys from a [`KeyStore`].
///
/// Share it by reference or `Arc`; every method takes `&self`.
pub struct EncryptionService {
    key_store: KeyStore,
    config: ServiceConfig,
    stats: Counters,
}

impl EncryptionService {
    /// Wrap `key_store`, generating the encryption and signature keys if
    /// either purpose has no active key yet.
    pub fn new(key_store: KeyStore, config: ServiceConfig) -> Result<Self> {
        config.validate()?;

        let key_store = key_store
            .with_default_algorithm(config.default_algorithm)
            .with_key_lifetime(Some(config.rotation.key_lifetime()));

        for purpose in KeyPurpose::ALL {
            if key_store.get_active_key(purpose).is_none() {
                key_store.generate_key(config.default_algorithm, purpose)?;
            }
        }

        Ok(Self {
            key_store,
            config,
            stats: Counters::default(),
        })
    }

    /// Open the key store in `config.key_dir` and build the service on it.
    pub fn open(config: ServiceConfig, protection: KeyProtection) -> Result<Self> {
        let key_store = KeyStore::open(Storage::new(&config.key_dir), protection)?;
        Self::new(key_store, config)
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Encrypt with the default algorithm and no metadata.
    pub fn encrypt_data(&self, plaintext: &[u8]) -> Result<EncryptionResult> {
        self.encrypt_data_with(plaintext, None, Metadata::new())
    }

    /// Encrypt under the active encryption key.
    ///
    /// A fresh nonce is drawn for every call. For AEAD algorithms the key id
    /// is bound as associated data.
    ///
    /// `algorithm` overrides the one the key was generated for; the same
    /// 32 key bytes are then used under the requested scheme.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveKey`] if the encryption key has been deactivated
    /// without a replacement.
    pub fn encrypt_data_with(
        &self,
        plaintext: &[u8],
        algorithm: Option<EncryptionAlgorithm>,
        metadata: Metadata,
    ) -> Result<EncryptionResult> {
        Counters::bump(&self.stats.encryption_operations);
        let algorithm = algorithm.unwrap_or(self.config.default_algorithm);

        let mut resolved = Resolved::with_algorithm(algorithm);
        self.seal_data(plaintext, algorithm, metadata, &mut resolved)
            .inspect_err(|err| self.record_failure("encrypt", &resolved, err))
    }

    fn seal_data(
        &self,
        plaintext: &[u8],
        algorithm: EncryptionAlgorithm,
        metadata: Metadata,
        resolved: &mut Resolved,
    ) -> Result<EncryptionResult> {
        let key = self
            .key_store
            .get_active_key(KeyPurpose::Encryption)
            .ok_or(Error::NoActiveKey(KeyPurpose::Encryption))?;
        resolved.key_id = Some(key.key_id().to_string());

        if algorithm != key.algorithm() {
            debug!(
                key_id = key.key_id(),
                key_algorithm = %key.algorithm(),
                %algorithm,
                "using key under a different algorithm"
            );
        }

        let cipher = key.cipher(algorithm)?;
        let nonce = generate_nonce(algorithm.nonce_len())?;

        let mut buf = Vec::with_capacity(plaintext.len() + CBC_IV_LEN);
        buf.extend_from_slice(plaintext);
        let tag = cipher.seal_in_place(&nonce, associated_data(algorithm, key.key_id()), &mut buf)?;

        debug!(
            key_id = key.key_id(),
            %algorithm,
            operation = "encrypt",
            size = plaintext.len(),
            "data encrypted"
        );

        Ok(EncryptionResult {
            ciphertext: buf,
            key_id: key.key_id().to_string(),
            algorithm,
            iv_or_nonce: nonce,
            tag,
            metadata,
        })
    }

    /// Decrypt with integrity failures reported as violations.
    pub fn decrypt_data(&self, result: &EncryptionResult) -> Result<DecryptionResult> {
        self.decrypt_data_with(result, true)
    }

    /// Decrypt `result` with the key it names, active or not.
    ///
    /// AEAD tags are always checked and a mismatch always yields
    /// `verified = false` with empty plaintext. `verify_integrity` decides
    /// whether such a mismatch counts as a failed operation and is logged as
    /// a warning. CBC carries no tag and reports `verified = true` whenever
    /// the padding is valid.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] for an unknown key id, or a length error for a
    /// malformed nonce.
    pub fn decrypt_data_with(
        &self,
        result: &EncryptionResult,
        verify_integrity: bool,
    ) -> Result<DecryptionResult> {
        Counters::bump(&self.stats.decryption_operations);
        let algorithm = result.algorithm;

        let opened = self
            .key_store
            .get_key(&result.key_id)
            .ok_or_else(|| Error::KeyNotFound(result.key_id.clone()))
            .and_then(|key| key.cipher(algorithm))
            .and_then(|cipher| {
                let mut buf = Zeroizing::new(result.ciphertext.clone());
                cipher
                    .open_in_place(
                        &result.iv_or_nonce,
                        associated_data(algorithm, &result.key_id),
                        &mut buf,
                        &result.tag,
                    )
                    .map(|()| buf)
            });

        match opened {
            Ok(plaintext) => {
                debug!(
                    key_id = %result.key_id,
                    %algorithm,
                    operation = "decrypt",
                    size = plaintext.len(),
                    "data decrypted"
                );
                Ok(DecryptionResult {
                    plaintext,
                    verified: true,
                    metadata: result.metadata.clone(),
                })
            }
            Err(Error::AuthenticationFailure) => {
                if verify_integrity {
                    Counters::bump(&self.stats.failed_operations);
                    warn!(
                        key_id = %result.key_id,
                        %algorithm,
                        operation = "decrypt",
                        "integrity verification failed"
                    );
                } else {
                    debug!(
                        key_id = %result.key_id,
                        %algorithm,
                        operation = "decrypt",
                        "ciphertext did not verify"
                    );
                }
                Ok(DecryptionResult {
                    plaintext: Zeroizing::new(Vec::new()),
                    verified: false,
                    metadata: result.metadata.clone(),
                })
            }
            Err(err) => {
                let resolved = Resolved {
                    key_id: Some(result.key_id.clone()),
                    ..Resolved::with_algorithm(algorithm)
                };
                self.record_failure("decrypt", &resolved, &err);
                Err(err)
            }
        }
    }

    /// Replace the active encryption key. Old ciphertexts stay decryptable.
    ///
    /// Returns `false` and logs the cause if the new key could not be stored.
    pub fn rotate_encryption_key(&self) -> bool {
        match self.key_store.rotate_key(KeyPurpose::Encryption) {
            Ok(key) => {
                Counters::bump(&self.stats.key_rotations);
                info!(key_id = key.key_id(), "encryption key rotated");
                true
            }
            Err(err) => {
                error!(error = %err, "encryption key rotation failed");
                false
            }
        }
    }

    /// Rotate every active key that is due under the rotation policy at
    /// `now`. Does nothing when automatic rotation is disabled.
    pub fn rotate_due_keys(&self, now: DateTime<Utc>) -> Result<Vec<CryptoKey>> {
        let policy = &self.config.rotation;
        if !policy.auto_rotation {
            return Ok(Vec::new());
        }

        let mut rotated = Vec::new();
        for purpose in KeyPurpose::ALL {
            let replacement = self.key_store.rotate_key_if(purpose, |active| {
                let due = policy.is_due(active, now);
                if due {
                    info!(
                        key_id = active.key_id(),
                        %purpose,
                        days_old = active.age(now).num_days(),
                        "rotating key"
                    );
                }
                due
            })?;

            if let Some(key) = replacement {
                Counters::bump(&self.stats.key_rotations);
                rotated.push(key);
            }
        }
        Ok(rotated)
    }

    pub fn deactivate_key(&self, key_id: &str) -> Result<bool> {
        self.key_store.deactivate_key(key_id)
    }

    /// Encrypt a file into a chunked envelope.
    ///
    /// Writes to `output`, or `<input>.encrypted` by default, and returns the
    /// path written. Returns `Ok(None)` if `input` does not exist.
    pub fn encrypt_file(&self, input: &Path, output: Option<&Path>) -> Result<Option<PathBuf>> {
        self.encrypt_file_with(input, output, &CancelToken::new())
    }

    /// [`encrypt_file`](Self::encrypt_file) that stops early once `cancel`
    /// fires. A cancelled or failed run leaves no output behind.
    pub fn encrypt_file_with(
        &self,
        input: &Path,
        output: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        if !input.exists() {
            debug!(file = %input.display(), "input file does not exist");
            return Ok(None);
        }
        Counters::bump(&self.stats.encryption_operations);

        let output = output.map_or_else(|| encrypted_path(input), Path::to_path_buf);
        let algorithm = envelope_algorithm(self.config.default_algorithm);
        let mut resolved = Resolved {
            algorithm: Some(algorithm),
            ..Resolved::for_file(input)
        };
        self.seal_file(input, &output, algorithm, cancel, &mut resolved)
            .map(|()| Some(output))
            .inspect_err(|err| self.record_failure("encrypt_file", &resolved, err))
    }

    fn seal_file(
        &self,
        input: &Path,
        output: &Path,
        algorithm: EncryptionAlgorithm,
        cancel: &CancelToken,
        resolved: &mut Resolved,
    ) -> Result<()> {
        let key = self
            .key_store
            .get_active_key(KeyPurpose::Encryption)
            .ok_or(Error::NoActiveKey(KeyPurpose::Encryption))?;
        resolved.key_id = Some(key.key_id().to_string());

        let chunk_size = u32::try_from(self.config.chunk_size)
            .map_err(|_| Error::Config(format!("chunk size {} too large", self.config.chunk_size)))?;
        let header = EnvelopeHeader::new(
            algorithm,
            chunk_size,
            generate_nonce(algorithm.nonce_len())?,
            key.key_id(),
        );
        let cipher = key.cipher(algorithm)?;

        let reader = BufReader::new(File::open(input)?);
        let mut pending = PendingFile::create(output)?;
        let chunks = {
            let mut writer = BufWriter::new(&mut pending);
            codec::encrypt_stream(&cipher, &header, reader, &mut writer, cancel)?
        };
        pending.commit()?;

        debug!(
            key_id = key.key_id(),
            %algorithm,
            operation = "encrypt_file",
            chunks,
            output = %output.display(),
            "file encrypted"
        );
        Ok(())
    }

    /// Decrypt an envelope produced by [`encrypt_file`](Self::encrypt_file).
    ///
    /// Writes to `output`, or by default the input path with `.encrypted`
    /// replaced by `.decrypted`. Nothing is written unless every chunk
    /// verifies. Returns `Ok(None)` if `input` does not exist.
    ///
    /// # Errors
    ///
    /// [`Error::ChunkAuthentication`] names the first chunk that failed;
    /// [`Error::MalformedEnvelope`] covers bad headers and truncation.
    pub fn decrypt_file(&self, input: &Path, output: Option<&Path>) -> Result<Option<PathBuf>> {
        self.decrypt_file_with(input, output, &CancelToken::new())
    }

    pub fn decrypt_file_with(
        &self,
        input: &Path,
        output: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        if !input.exists() {
            debug!(file = %input.display(), "input file does not exist");
            return Ok(None);
        }
        Counters::bump(&self.stats.decryption_operations);

        let output = output.map_or_else(|| decrypted_path(input), Path::to_path_buf);
        let mut resolved = Resolved::for_file(input);
        self.open_file(input, &output, cancel, &mut resolved)
            .map(|()| Some(output))
            .inspect_err(|err| self.record_failure("decrypt_file", &resolved, err))
    }

    fn open_file(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancelToken,
        resolved: &mut Resolved,
    ) -> Result<()> {
        let mut reader = BufReader::new(File::open(input)?);
        let (header, header_bytes) = format::read_header(&mut reader)?;
        resolved.key_id = Some(header.key_id().to_string());
        resolved.algorithm = Some(header.algorithm());

        let key = self
            .key_store
            .get_key(header.key_id())
            .ok_or_else(|| Error::KeyNotFound(header.key_id().to_string()))?;
        let cipher = key.cipher(header.algorithm())?;

        let mut pending = PendingFile::create(output)?;
        let chunks = {
            let mut writer = BufWriter::new(&mut pending);
            codec::decrypt_stream(&cipher, &header, &header_bytes, reader, &mut writer, cancel)?
        };
        pending.commit()?;

        debug!(
            key_id = header.key_id(),
            algorithm = %header.algorithm(),
            operation = "decrypt_file",
            chunks,
            output = %output.display(),
            "file decrypted"
        );
        Ok(())
    }

    fn record_failure(&self, operation: &'static str, resolved: &Resolved, err: &Error) {
        Counters::bump(&self.stats.failed_operations);
        warn!(
            key_id = resolved.key_id.as_deref(),
            algorithm = resolved.algorithm.map(EncryptionAlgorithm::as_str),
            operation,
            chunk = err.chunk_index(),
            file = resolved.file.as_deref().map(|p| p.display().to_string()),
            error = %err,
            "cryptographic operation failed"
        );
    }

    pub fn get_encryption_stats(&self) -> EncryptionStats {
        EncryptionStats {
            encryption_operations: self.stats.encryption_operations.load(Ordering::Relaxed),
            decryption_operations: self.stats.decryption_operations.load(Ordering::Relaxed),
            key_rotations: self.stats.key_rotations.load(Ordering::Relaxed),
            failed_operations: self.stats.failed_operations.load(Ordering::Relaxed),
            active_keys: self.key_store.active_key_count(),
            active_encryption_keys: usize::from(
                self.key_store.get_active_key(KeyPurpose::Encryption).is_some(),
            ),
            total_keys: self.key_store.key_count(),
            default_algorithm: self.config.default_algorithm,
            keystore_path: self.key_store.location().to_path_buf(),
        }
    }
}

/// Key and algorithm an operation had settled on before it failed.
#[derive(Debug, Default)]
struct Resolved {
    key_id: Option<String>,
    algorithm: Option<EncryptionAlgorithm>,
    file: Option<PathBuf>,
}

impl Resolved {
    fn with_algorithm(algorithm: EncryptionAlgorithm) -> Self {
        Self {
            algorithm: Some(algorithm),
            ..Self::default()
        }
    }

    fn for_file(input: &Path) -> Self {
        Self {
            file: Some(input.to_path_buf()),
            ..Self::default()
        }
    }
}

fn associated_data(algorithm: EncryptionAlgorithm, key_id: &str) -> &[u8] {
    if algorithm.is_authenticated() {
        key_id.as_bytes()
    } else {
        &[]
    }
}

// Envelopes need per-chunk tags.
fn envelope_algorithm(default: EncryptionAlgorithm) -> EncryptionAlgorithm {
    if default.is_authenticated() {
        default
    } else {
        EncryptionAlgorithm::Aes256Gcm
    }
}

fn encrypted_path(input: &Path) -> PathBuf {
    let mut path = input.as_os_str().to_owned();
    path.push(ENCRYPTED_SUFFIX);
    PathBuf::from(path)
}

fn decrypted_path(input: &Path) -> PathBuf {
    match input.to_str().and_then(|s| s.strip_suffix(ENCRYPTED_SUFFIX)) {
        Some(stem) => PathBuf::from(format!("{stem}{DECRYPTED_SUFFIX}")),
        None => {
            let mut path = input.as_os_str().to_owned();
            path.push(DECRYPTED_SUFFIX);
            PathBuf::from(path)
        }
    }
}
