//! Bearer token lifecycle
//!
//! [`TokenManager`] hands out a token that stays usable for at least
//! `margin_seconds`. It keeps the current credential in memory and, once the
//! credential is near expiry, refreshes it through an injected
//! [`TokenSource`]. Refreshes are serialized inside the process by an async
//! mutex and across processes by the token cache's advisory lock; after
//! taking the lock the cache is read again so a refresh finished elsewhere
//! is adopted instead of repeated.
//!
//! The cache is the single source of truth for expiry: the manager never
//! derives expiry on its own and never writes the cache itself.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AuthError, AuthResult};
use crate::graph::token_cache::{CacheLock, TokenCache};

/// Default safety margin before expiry
pub const DEFAULT_MARGIN_SECONDS: i64 = 500;

/// Default bound on waiting for the cache lock
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Acquisition callback.
///
/// Implementations obtain a fresh bearer token (silently or interactively)
/// and are expected to record its expiry in the token cache before
/// returning, unless the manager was given an [`ExpiryLookup`].
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> AuthResult<String>;
}

/// Expiry-lookup callback returning Unix seconds
pub type ExpiryLookup = Box<dyn Fn() -> AuthResult<i64> + Send + Sync>;

/// A bearer token and its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: i64,
}

impl Credential {
    /// Usable for at least `margin_seconds` after `now`
    pub fn is_fresh(&self, now: i64, margin_seconds: i64) -> bool {
        now + margin_seconds < self.expires_at
    }
}

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    Valid,
    NearExpiry,
    Refreshing,
}

/// Builder for [`TokenManager`]
pub struct TokenManagerBuilder {
    cache: TokenCache,
    source: Arc<dyn TokenSource>,
    account: Option<String>,
    expiry_lookup: Option<ExpiryLookup>,
    margin_seconds: i64,
    lock_wait: Duration,
}

impl TokenManagerBuilder {
    /// Account key to read from the cache; the first account otherwise
    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Read expiry from a callback instead of the cache
    pub fn expiry_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn() -> AuthResult<i64> + Send + Sync + 'static,
    {
        self.expiry_lookup = Some(Box::new(lookup));
        self
    }

    pub fn margin_seconds(mut self, margin_seconds: i64) -> Self {
        self.margin_seconds = margin_seconds;
        self
    }

    pub fn lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Acquire the first token and load its expiry
    pub async fn build(self) -> AuthResult<TokenManager> {
        let mut manager = TokenManager {
            cache: self.cache,
            source: self.source,
            account: self.account,
            expiry_lookup: self.expiry_lookup,
            margin_seconds: self.margin_seconds,
            lock_wait: self.lock_wait,
            credential: RwLock::new(Credential {
                token: String::new(),
                expires_at: 0,
            }),
            refresh_gate: Mutex::new(()),
        };

        let token = manager.source.acquire().await?;
        let expires_at = manager.load_expiry()?;
        tracing::debug!("Initial token acquired, expires at {}", expires_at);
        *manager.credential.get_mut() = Credential { token, expires_at };

        Ok(manager)
    }
}

/// Owns the process's bearer token
pub struct TokenManager {
    cache: TokenCache,
    source: Arc<dyn TokenSource>,
    account: Option<String>,
    expiry_lookup: Option<ExpiryLookup>,
    margin_seconds: i64,
    lock_wait: Duration,
    credential: RwLock<Credential>,
    refresh_gate: Mutex<()>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("cache", &self.cache.path())
            .field("account", &self.account)
            .field("margin_seconds", &self.margin_seconds)
            .field("lock_wait", &self.lock_wait)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn builder(cache: TokenCache, source: Arc<dyn TokenSource>) -> TokenManagerBuilder {
        TokenManagerBuilder {
            cache,
            source,
            account: None,
            expiry_lookup: None,
            margin_seconds: DEFAULT_MARGIN_SECONDS,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Expiry of the token currently held
    pub async fn expires_at(&self) -> i64 {
        self.credential.read().await.expires_at
    }

    pub async fn phase(&self) -> TokenPhase {
        if self.refresh_gate.try_lock().is_err() {
            return TokenPhase::Refreshing;
        }
        if self.credential.read().await.is_fresh(unix_now(), self.margin_seconds) {
            TokenPhase::Valid
        } else {
            TokenPhase::NearExpiry
        }
    }

    /// Get a token usable for at least `margin_seconds`, refreshing if needed
    pub async fn get_token(&self) -> AuthResult<String> {
        {
            let credential = self.credential.read().await;
            if credential.is_fresh(unix_now(), self.margin_seconds) {
                return Ok(credential.token.clone());
            }
        }

        self.refresh().await
    }

    async fn refresh(&self) -> AuthResult<String> {
        let _gate = self.refresh_gate.lock().await;

        // Another task may have refreshed while we queued on the gate.
        {
            let credential = self.credential.read().await;
            if credential.is_fresh(unix_now(), self.margin_seconds) {
                return Ok(credential.token.clone());
            }
        }

        let lock_path = self.cache.lock_path();
        let lock = match CacheLock::acquire(&lock_path, self.lock_wait).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                tracing::warn!(
                    "Token cache lock {} not acquired within {:?}; continuing unsynchronized",
                    lock_path.display(),
                    self.lock_wait
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Token cache lock {} unavailable ({}); continuing unsynchronized",
                    lock_path.display(),
                    e
                );
                None
            }
        };

        if let Some(token) = self.adopt_cached().await {
            return Ok(token);
        }

        tracing::info!("Access token near expiry, refreshing");
        let token = self.source.acquire().await?;
        let expires_at = self.load_expiry()?;
        drop(lock);

        if unix_now() + self.margin_seconds >= expires_at {
            tracing::warn!(
                "Refreshed token expires at {}, inside the {}s margin",
                expires_at,
                self.margin_seconds
            );
        }

        *self.credential.write().await = Credential {
            token: token.clone(),
            expires_at,
        };
        Ok(token)
    }

    /// Take over a fresh credential that another process wrote to the cache.
    ///
    /// Only possible when expiry comes from the cache; an expiry-lookup
    /// callback says nothing about which token it describes.
    async fn adopt_cached(&self) -> Option<String> {
        if self.expiry_lookup.is_some() {
            return None;
        }

        let cached = match self.cache.credential(self.account.as_deref()) {
            Ok(cached) => cached?,
            Err(e) => {
                tracing::warn!("Ignoring unreadable token cache: {}", e);
                return None;
            }
        };

        let credential = Credential {
            token: cached.token,
            expires_at: cached.expires_at,
        };
        if !credential.is_fresh(unix_now(), self.margin_seconds) {
            return None;
        }

        tracing::debug!("Adopting token refreshed elsewhere, expires at {}", credential.expires_at);
        let token = credential.token.clone();
        *self.credential.write().await = credential;
        Some(token)
    }

    fn load_expiry(&self) -> AuthResult<i64> {
        if let Some(lookup) = &self.expiry_lookup {
            return lookup();
        }

        self.cache
            .credential(self.account.as_deref())?
            .map(|cached| cached.expires_at)
            .ok_or_else(|| AuthError::ExpiryUnavailable {
                path: self.cache.path().display().to_string(),
            })
    }
}

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::token_cache::CachedCredential;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Writes `token-N` to the cache with the N-th configured lifetime
    struct ScriptedSource {
        cache: TokenCache,
        account: String,
        lifetimes: Vec<i64>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(cache: &TokenCache, lifetimes: &[i64]) -> Arc<Self> {
            Arc::new(Self {
                cache: cache.clone(),
                account: "default".to_string(),
                lifetimes: lifetimes.to_vec(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn acquire(&self) -> AuthResult<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let lifetime = self.lifetimes[n.min(self.lifetimes.len() - 1)];
            let token = format!("token-{}", n);
            self.cache
                .upsert(&self.account, CachedCredential::new(&token, unix_now() + lifetime))?;
            Ok(token)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl TokenSource for FailingSource {
        async fn acquire(&self) -> AuthResult<String> {
            Err(AuthError::ConsentDeclined {
                message: "user closed the prompt".to_string(),
            })
        }
    }

    fn temp_cache() -> (tempfile::TempDir, TokenCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("token_cache.json"));
        (dir, cache)
    }

    #[test]
    fn test_freshness_respects_margin() {
        let credential = Credential {
            token: "t".to_string(),
            expires_at: 1_000,
        };
        assert!(credential.is_fresh(400, 500));
        assert!(!credential.is_fresh(500, 500));
        assert!(!credential.is_fresh(900, 500));
    }

    #[tokio::test]
    async fn test_construction_acquires_once_and_reads_cache_expiry() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[3600]);

        let manager = TokenManager::builder(cache.clone(), source.clone())
            .build()
            .await
            .unwrap();

        assert_eq!(source.calls(), 1);
        let cached = cache.credential(None).unwrap().unwrap();
        assert_eq!(manager.expires_at().await, cached.expires_at);
        assert_eq!(manager.phase().await, TokenPhase::Valid);
    }

    #[tokio::test]
    async fn test_token_reused_within_margin() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[3600]);
        let manager = TokenManager::builder(cache, source.clone())
            .build()
            .await
            .unwrap();

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_token_is_refreshed() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10, 3600]);
        let manager = TokenManager::builder(cache, source.clone())
            .build()
            .await
            .unwrap();
        assert_eq!(manager.phase().await, TokenPhase::NearExpiry);

        let token = manager.get_token().await.unwrap();

        assert_eq!(token, "token-1");
        assert_eq!(source.calls(), 2);
        assert_eq!(manager.phase().await, TokenPhase::Valid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_refresh_once() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10, 3600]);
        let manager = Arc::new(
            TokenManager::builder(cache, source.clone())
                .build()
                .await
                .unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_managers_sharing_a_cache_refresh_once() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10, 10, 3600]);

        let first = Arc::new(
            TokenManager::builder(cache.clone(), source.clone())
                .build()
                .await
                .unwrap(),
        );
        let second = Arc::new(
            TokenManager::builder(cache.clone(), source.clone())
                .build()
                .await
                .unwrap(),
        );
        assert_eq!(source.calls(), 2);

        let a = tokio::spawn({
            let first = first.clone();
            async move { first.get_token().await }
        });
        let b = tokio::spawn({
            let second = second.clone();
            async move { second.get_token().await }
        });

        assert_eq!(a.await.unwrap().unwrap(), "token-2");
        assert_eq!(b.await.unwrap().unwrap(), "token-2");
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_lock_timeout_degrades_to_unsynchronized_refresh() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10, 3600]);
        let manager = TokenManager::builder(cache.clone(), source.clone())
            .lock_wait(Duration::from_millis(50))
            .build()
            .await
            .unwrap();

        let _held = CacheLock::acquire(&cache.lock_path(), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        let token = assert_ok!(manager.get_token().await);
        assert_eq!(token, "token-1");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_lock_timeout_adopts_fresh_cache_without_acquiring() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10]);
        let manager = TokenManager::builder(cache.clone(), source.clone())
            .lock_wait(Duration::from_millis(50))
            .build()
            .await
            .unwrap();

        let _held = CacheLock::acquire(&cache.lock_path(), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        cache
            .upsert("default", CachedCredential::new("written-elsewhere", unix_now() + 3600))
            .unwrap();

        assert_eq!(manager.get_token().await.unwrap(), "written-elsewhere");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_acquisition_failure_propagates_and_next_call_retries() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10, 3600]);
        let mut manager = TokenManager::builder(cache, source.clone())
            .build()
            .await
            .unwrap();

        let failing: Arc<dyn TokenSource> = Arc::new(FailingSource);
        let working = std::mem::replace(&mut manager.source, failing);
        let err = assert_err!(manager.get_token().await);
        assert!(matches!(err, AuthError::ConsentDeclined { .. }));
        assert_eq!(manager.phase().await, TokenPhase::NearExpiry);

        manager.source = working;
        assert_eq!(manager.get_token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_construction_failure_propagates() {
        let (_dir, cache) = temp_cache();
        let err = TokenManager::builder(cache, Arc::new(FailingSource))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ConsentDeclined { .. }));
    }

    #[tokio::test]
    async fn test_missing_cache_entry_is_expiry_unavailable() {
        struct SilentSource;

        #[async_trait]
        impl TokenSource for SilentSource {
            async fn acquire(&self) -> AuthResult<String> {
                Ok("untracked".to_string())
            }
        }

        let (_dir, cache) = temp_cache();
        let err = TokenManager::builder(cache, Arc::new(SilentSource))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiryUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_expiry_lookup_replaces_cache_read() {
        let (_dir, cache) = temp_cache();
        let source = ScriptedSource::new(&cache, &[10]);
        let expires_at = unix_now() + 7200;

        let manager = TokenManager::builder(cache, source.clone())
            .expiry_lookup(move || Ok(expires_at))
            .build()
            .await
            .unwrap();

        assert_eq!(manager.expires_at().await, expires_at);
        assert_eq!(manager.get_token().await.unwrap(), "token-0");
        assert_eq!(source.calls(), 1);
    }
}
