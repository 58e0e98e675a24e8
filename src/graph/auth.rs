//! Microsoft identity platform authentication
//!
//! Implements [`TokenSource`] on top of the OAuth 2.0 authorization code and
//! refresh token grants. Every successful grant is written to the shared
//! [`TokenCache`], which is where [`TokenManager`](super::token_manager::TokenManager)
//! reads expiry from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{AuthError, AuthResult};
use crate::graph::token_cache::{CacheLock, CachedCredential, TokenCache};
use crate::graph::token_manager::{unix_now, TokenSource};

/// Token response from the identity platform
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

/// Error body from the identity platform
#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Lifetime assumed when the identity platform omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Acquires Graph tokens for one cached account
pub struct MicrosoftAuthenticator {
    config: Config,
    client_id: String,
    token_url: String,
    http_client: reqwest::Client,
    cache: TokenCache,
}

impl MicrosoftAuthenticator {
    /// Create an authenticator. Fails when no client ID is configured.
    pub fn new(config: Config) -> AuthResult<Self> {
        let client_id = config
            .client_id
            .clone()
            .ok_or_else(|| AuthError::ClientIdMissing {
                var: "OUTLOOK_CLIENT_ID".to_string(),
            })?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthError::TokenRefreshFailed {
                message: e.to_string(),
            })?;

        Ok(Self {
            token_url: config.token_url(),
            cache: TokenCache::new(&config.token_cache_path),
            client_id,
            config,
            http_client,
        })
    }

    /// Point token requests at a different endpoint
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Generate the authorization URL
    pub fn generate_auth_url(&self) -> String {
        let scopes = self.config.scopes.join(" ");
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&response_mode=query&scope={}&prompt=select_account",
            self.config.authorize_url(),
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.config.oauth_callback_url),
            urlencoding::encode(&scopes)
        )
    }

    /// Exchange an authorization code for tokens and cache them, holding the
    /// cache's advisory lock for the write
    pub async fn exchange_code(&self, code: &str) -> AuthResult<CachedCredential> {
        let _lock = self.lock_cache().await;
        self.redeem_code(code).await
    }

    /// Take the cache lock, or continue without it once `lock_wait` passes
    async fn lock_cache(&self) -> Option<CacheLock> {
        let lock_path = self.cache.lock_path();
        match CacheLock::acquire(&lock_path, self.config.lock_wait).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                tracing::warn!(
                    "Token cache lock {} not acquired within {:?}; writing unsynchronized",
                    lock_path.display(),
                    self.config.lock_wait
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Token cache lock {} unavailable ({}); writing unsynchronized",
                    lock_path.display(),
                    e
                );
                None
            }
        }
    }

    /// Code exchange for callers that already hold the cache lock
    async fn redeem_code(&self, code: &str) -> AuthResult<CachedCredential> {
        let scopes = self.config.scopes.join(" ");
        let grant = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.oauth_callback_url.as_str()),
            ("scope", scopes.as_str()),
        ];

        let response = self
            .request_token(&grant)
            .await
            .map_err(|message| AuthError::TokenExchangeFailed { message })?;
        self.store(response, None)
    }

    /// Redeem a refresh token and cache the result
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<CachedCredential> {
        let scopes = self.config.scopes.join(" ");
        let grant = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scopes.as_str()),
        ];

        let response = self
            .request_token(&grant)
            .await
            .map_err(|message| AuthError::TokenRefreshFailed { message })?;
        self.store(response, Some(refresh_token))
    }

    /// POST a grant to the token endpoint. Errors are the identity
    /// platform's description, or the raw body.
    async fn request_token(&self, grant: &[(&str, &str)]) -> Result<TokenResponse, String> {
        let mut form: Vec<(&str, &str)> = grant.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;

        if !status.is_success() {
            let detail: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            return Err(if detail.error.is_empty() {
                format!("{}: {}", status, body)
            } else {
                format!("{}: {}", detail.error, detail.error_description)
            });
        }

        serde_json::from_str(&body).map_err(|e| format!("invalid token response: {}", e))
    }

    /// Write a grant to the cache, keeping the previous refresh token when
    /// the response did not rotate it
    fn store(&self, response: TokenResponse, previous_refresh: Option<&str>) -> AuthResult<CachedCredential> {
        let existing = self.cache.credential(Some(self.config.account.as_str()))?;

        let mut credential = existing.unwrap_or_else(|| CachedCredential::new("", 0));
        credential.token = response.access_token;
        credential.expires_at = unix_now() + response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        credential.refresh_token = response
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string));
        credential.scope = response.scope;

        self.cache.upsert(&self.config.account, credential.clone())?;
        tracing::debug!(
            "Cached token for account '{}' until {}",
            self.config.account,
            credential.expires_at
        );
        Ok(credential)
    }

    /// Run the interactive consent flow and cache the tokens.
    ///
    /// The cache lock is only taken once the code arrives, so a server
    /// sharing the cache is not blocked while the user signs in.
    pub async fn authenticate_interactive(&self) -> AuthResult<CachedCredential> {
        let code = self.receive_code().await?;
        eprintln!("Authorization code received, redeeming...");
        let credential = self.exchange_code(&code).await?;
        eprintln!("Signed in.");
        Ok(credential)
    }

    /// Consent flow used from [`TokenSource::acquire`], which already runs
    /// under the cache lock
    async fn consent_locked(&self) -> AuthResult<CachedCredential> {
        let code = self.receive_code().await?;
        self.redeem_code(&code).await
    }

    /// Open the consent page and wait for the redirect's authorization code
    async fn receive_code(&self) -> AuthResult<String> {
        use axum::{extract::Query, response::Html, routing::get, Router};
        use tokio::sync::oneshot;

        let auth_url = self.generate_auth_url();
        eprintln!("\nSign in to Microsoft to continue:");
        eprintln!("{}\n", auth_url);

        if let Err(e) = open::that(&auth_url) {
            eprintln!("Could not open a browser ({}); open the URL above manually.", e);
        }

        let (tx, rx) = oneshot::channel::<AuthResult<String>>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

        let callback = move |Query(params): Query<HashMap<String, String>>| async move {
            let outcome = callback_outcome(&params);
            let page = match &outcome {
                Ok(_) => "<html><body><h1>Signed in</h1><p>You can close this window.</p></body></html>",
                Err(_) => "<html><body><h1>Sign-in failed</h1><p>Return to the terminal for details.</p></body></html>",
            };
            if let Some(sender) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = sender.send(outcome);
            }
            Html(page)
        };

        let app = Router::new().route("/oauth2callback", get(callback));
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], self.config.oauth_callback_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::CallbackError {
                message: format!("cannot listen on {}: {}", addr, e),
            })?;

        eprintln!(
            "Waiting for the sign-in redirect on port {}...",
            self.config.oauth_callback_port
        );

        let code = tokio::select! {
            result = axum::serve(listener, app) => {
                let message = match result {
                    Ok(()) => "callback server stopped".to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(AuthError::CallbackError { message });
            }
            received = rx => received.map_err(|_| AuthError::NoAuthCode)??,
        };
        Ok(code)
    }
}

/// Interpret the redirect's query string
fn callback_outcome(params: &HashMap<String, String>) -> AuthResult<String> {
    if let Some(error) = params.get("error") {
        let description = params.get("error_description").cloned().unwrap_or_default();
        return Err(AuthError::ConsentDeclined {
            message: format!("{} {}", error, description).trim().to_string(),
        });
    }

    params
        .get("code")
        .filter(|code| !code.is_empty())
        .cloned()
        .ok_or(AuthError::NoAuthCode)
}

#[async_trait]
impl TokenSource for MicrosoftAuthenticator {
    /// Refresh from the cached refresh token, falling back to browser
    /// consent only when interactive mode is enabled
    async fn acquire(&self) -> AuthResult<String> {
        let refresh_token = self
            .cache
            .credential(Some(self.config.account.as_str()))?
            .and_then(|cached| cached.refresh_token);

        let credential = match refresh_token {
            Some(refresh_token) => match self.refresh(&refresh_token).await {
                Ok(credential) => credential,
                Err(e) if self.config.interactive => {
                    tracing::warn!("Refresh failed ({}); asking for consent again", e);
                    self.consent_locked().await?
                }
                Err(e) => return Err(e),
            },
            None if self.config.interactive => self.consent_locked().await?,
            None => {
                return Err(AuthError::NotAuthenticated {
                    path: self.cache.path().display().to_string(),
                })
            }
        };

        tracing::info!("Acquired access token for account '{}'", self.config.account);
        Ok(credential.token)
    }
}
