//! File-backed token cache shared across processes
//!
//! The cache is a JSON document keyed by account:
//!
//! ```json
//! { "accounts": { "default": { "token": "...", "expires_at": 1735689600 } } }
//! ```
//!
//! Writers serialize through an advisory lock on a sibling `<path>.lock`
//! file. The cache document itself is replaced atomically so a reader that
//! skips the lock still sees either the old or the new document.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::CacheError;

/// Interval between lock attempts while waiting
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Suffix for temp files so concurrent saves in one process never share one
static SAVE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A credential as persisted in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCredential {
    /// Bearer token
    pub token: String,

    /// Absolute expiry (Unix seconds)
    #[serde(deserialize_with = "epoch_seconds")]
    pub expires_at: i64,

    /// Refresh token, when the identity platform issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scopes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    /// Fields written by other tools, kept on rewrite
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedCredential {
    pub fn new(token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            token: token.into(),
            expires_at,
            refresh_token: None,
            scope: String::new(),
            extra: Map::new(),
        }
    }
}

/// The whole cache document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default)]
    pub accounts: BTreeMap<String, CachedCredential>,
}

impl CacheDocument {
    /// Look up a named account, or the first account when `account` is `None`
    pub fn credential(&self, account: Option<&str>) -> Option<&CachedCredential> {
        match account {
            Some(key) => self.accounts.get(key),
            None => self.accounts.values().next(),
        }
    }
}

/// Handle on the on-disk token cache
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the advisory lock file colocated with the cache
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Read the cache. A missing or empty file is an empty document.
    pub fn load(&self) -> Result<CacheDocument, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CacheDocument::default()),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(CacheDocument::default());
        }

        serde_json::from_str(&content).map_err(|source| CacheError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the cache document
    pub fn save(&self, document: &CacheDocument) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(document).map_err(|source| CacheError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(format!(
            ".tmp-{}-{}",
            std::process::id(),
            SAVE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp_path = PathBuf::from(tmp_name);

        if let Err(e) = std::fs::write(&tmp_path, content) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            io_err(e)
        })
    }

    /// Read one account's credential
    pub fn credential(&self, account: Option<&str>) -> Result<Option<CachedCredential>, CacheError> {
        Ok(self.load()?.credential(account).cloned())
    }

    /// Insert or replace one account's credential, keeping the others
    pub fn upsert(&self, account: &str, credential: CachedCredential) -> Result<(), CacheError> {
        let mut document = self.load()?;
        document.accounts.insert(account.to_string(), credential);
        self.save(&document)
    }
}

/// Exclusive advisory lock on the cache's lock file, released on drop
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Try to take the lock, polling until `wait` elapses.
    ///
    /// Returns `Ok(None)` when the lock is still held by someone else at
    /// the deadline.
    pub async fn acquire(path: &Path, wait: Duration) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let deadline = Instant::now() + wait;
        loop {
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(Some(Self {
                        file,
                        path: path.to_path_buf(),
                    }))
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::debug!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

/// Accept expiry as an integer or a numeric string
fn epoch_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(secs) => Ok(secs),
        Raw::Float(secs) => Ok(secs as i64),
        Raw::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid expiry timestamp: {}", text))),
    }
}
