use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::crypto::EncryptionAlgorithm;
use crate::error::{Error, Result};
use crate::key::CryptoKey;

pub const ENV_KEY_DIR: &str = "KEYWARD_KEY_DIR";
pub const ENV_DEFAULT_ALGORITHM: &str = "KEYWARD_DEFAULT_ALGORITHM";
pub const ENV_CHUNK_SIZE: &str = "KEYWARD_CHUNK_SIZE";

/// When keys should be replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Lifetime of a generated key; it expires afterwards.
    pub max_age_days: u32,
    /// Age at which an active key is due for rotation.
    pub rotation_interval_days: u32,
    pub auto_rotation: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 90,
            rotation_interval_days: 30,
            auto_rotation: true,
        }
    }
}

impl RotationPolicy {
    pub fn key_lifetime(&self) -> Duration {
        Duration::days(i64::from(self.max_age_days))
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::days(i64::from(self.rotation_interval_days))
    }

    /// Whether `key` has reached its rotation interval or expired at `now`.
    pub fn is_due(&self, key: &CryptoKey, now: DateTime<Utc>) -> bool {
        key.age(now) >= self.rotation_interval() || key.is_expired(now)
    }
}

/// Settings for an [`EncryptionService`](crate::EncryptionService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub key_dir: PathBuf,
    pub default_algorithm: EncryptionAlgorithm,
    /// Plaintext bytes per file chunk.
    pub chunk_size: usize,
    pub rotation: RotationPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("keys"),
            default_algorithm: EncryptionAlgorithm::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            rotation: RotationPolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `KEYWARD_*` environment variables.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = var(ENV_KEY_DIR).filter(|v| !v.is_empty()) {
            self.key_dir = PathBuf::from(dir);
        }
        if let Some(algorithm) = var(ENV_DEFAULT_ALGORITHM).filter(|v| !v.is_empty()) {
            self.default_algorithm = algorithm.parse()?;
        }
        if let Some(size) = var(ENV_CHUNK_SIZE).filter(|v| !v.is_empty()) {
            self.chunk_size = size
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_CHUNK_SIZE} is not a number: {size}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        Ok(())
    }
}
