use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

/// Durable cache key for the token value.
pub const KEY_TOKEN_VALUE: &str = "csrf_token";
/// Durable cache key for the expiry timestamp (ms since epoch, stored as a
/// decimal string).
pub const KEY_TOKEN_EXPIRES_AT: &str = "csrf_token_expires_at";

const PROBE_KEY: &str = ".quill_storage_probe";
const PROBE_VALUE: &str = "ok";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable")]
    Unavailable,
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored expiry is not a timestamp: {raw}")]
    MalformedExpiry { raw: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub value: String,
    pub expires_at_ms: u64,
}

/// Durable token cache. Persistence is an optimization: implementations may
/// degrade to no-ops, and the token manager treats every error here as a
/// cache miss.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredToken>, StorageError>;
    fn persist(&self, token: &StoredToken) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// File-backed store: one file per key inside a scoped directory, the native
/// analog of tab-scoped web storage.
///
/// Availability is decided by a lazy capability probe (write a sentinel key,
/// read it back, remove it) performed once per instance. A failed probe
/// routes every later access through a no-op branch instead of repeating
/// failing filesystem calls.
#[derive(Debug)]
pub struct FileTokenStore {
    dir: PathBuf,
    capability: OnceLock<bool>,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            capability: OnceLock::new(),
        }
    }

    fn available(&self) -> bool {
        *self.capability.get_or_init(|| {
            let usable = self.probe();
            if !usable {
                tracing::warn!(
                    dir = %self.dir.display(),
                    "token storage unavailable, continuing memory-only"
                );
            }
            usable
        })
    }

    fn probe(&self) -> bool {
        if fs::create_dir_all(&self.dir).is_err() {
            return false;
        }
        let probe_path = self.dir.join(PROBE_KEY);
        if fs::write(&probe_path, PROBE_VALUE).is_err() {
            return false;
        }
        let verified = matches!(fs::read_to_string(&probe_path), Ok(contents) if contents == PROBE_VALUE);
        let _ = fs::remove_file(&probe_path);
        verified
    }

    fn read_key(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.dir.join(key)).ok()
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<StoredToken>, StorageError> {
        if !self.available() {
            return Ok(None);
        }
        let Some(value) = self.read_key(KEY_TOKEN_VALUE) else {
            return Ok(None);
        };
        let Some(raw_expiry) = self.read_key(KEY_TOKEN_EXPIRES_AT) else {
            return Ok(None);
        };
        let expires_at_ms = raw_expiry
            .trim()
            .parse::<u64>()
            .map_err(|_| StorageError::MalformedExpiry { raw: raw_expiry })?;
        Ok(Some(StoredToken {
            value,
            expires_at_ms,
        }))
    }

    fn persist(&self, token: &StoredToken) -> Result<(), StorageError> {
        if !self.available() {
            return Ok(());
        }
        fs::write(self.dir.join(KEY_TOKEN_VALUE), &token.value)?;
        fs::write(
            self.dir.join(KEY_TOKEN_EXPIRES_AT),
            token.expires_at_ms.to_string(),
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        if !self.available() {
            return Ok(());
        }
        for key in [KEY_TOKEN_VALUE, KEY_TOKEN_EXPIRES_AT] {
            let path = self.dir.join(key);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and for callers that opt out of persistence.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<StoredToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<StoredToken>, StorageError> {
        Ok(self.lock().clone())
    }

    fn persist(&self, token: &StoredToken) -> Result<(), StorageError> {
        *self.lock() = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.lock() = None;
        Ok(())
    }
}

impl MemoryTokenStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<StoredToken>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
