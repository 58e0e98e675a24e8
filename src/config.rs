//! Configuration management for the Outlook MCP Server
//!
//! Handles paths, environment variables, and configuration loading.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, OutlookMcpError, Result};

/// Configuration for the Outlook MCP Server
#[derive(Debug, Clone)]
pub struct Config {
    /// Application (client) ID registered with the Microsoft identity platform
    pub client_id: Option<String>,

    /// Client secret, only for confidential app registrations
    pub client_secret: Option<String>,

    /// Directory tenant (`common`, `organizations`, `consumers` or a tenant ID)
    pub tenant_id: String,

    /// Delegated Graph scopes
    pub scopes: Vec<String>,

    /// Path to the shared token cache
    pub token_cache_path: PathBuf,

    /// Account key inside the token cache
    pub account: String,

    /// Seconds before expiry at which a token counts as stale
    pub token_margin_secs: i64,

    /// Upper bound on waiting for the token cache lock
    pub lock_wait: Duration,

    /// Client-wide timeout for Graph requests
    pub request_timeout: Duration,

    /// OAuth callback port
    pub oauth_callback_port: u16,

    /// OAuth callback URL (must be registered as a redirect URI)
    pub oauth_callback_url: String,

    /// Whether token acquisition may fall back to browser consent
    pub interactive: bool,

    /// Graph API base URL
    pub graph_base_url: String,
}

impl Config {
    /// Create a new configuration from the environment with default paths
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;

        let token_cache_path = std::env::var("OUTLOOK_TOKEN_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir.join("token_cache.json"));

        let scopes = std::env::var("OUTLOOK_SCOPES")
            .map(|raw| parse_scopes(&raw))
            .unwrap_or_else(|_| graph::DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());

        let oauth_callback_port = env_parse("OUTLOOK_OAUTH_PORT", 3000)?;
        let oauth_callback_url = format!("http://localhost:{}/oauth2callback", oauth_callback_port);

        Ok(Self {
            client_id: env_non_empty("OUTLOOK_CLIENT_ID"),
            client_secret: env_non_empty("OUTLOOK_CLIENT_SECRET"),
            tenant_id: env_non_empty("OUTLOOK_TENANT_ID").unwrap_or_else(|| "common".to_string()),
            scopes,
            token_cache_path,
            account: env_non_empty("OUTLOOK_ACCOUNT").unwrap_or_else(|| "default".to_string()),
            token_margin_secs: env_parse("OUTLOOK_TOKEN_MARGIN_SECS", 500)?,
            lock_wait: Duration::from_secs(env_parse("OUTLOOK_LOCK_WAIT_SECS", 5)?),
            request_timeout: Duration::from_secs(env_parse("OUTLOOK_REQUEST_TIMEOUT_SECS", 30)?),
            oauth_callback_port,
            oauth_callback_url,
            interactive: env_parse("OUTLOOK_INTERACTIVE", false)?,
            graph_base_url: env_non_empty("OUTLOOK_GRAPH_BASE_URL")
                .unwrap_or_else(|| graph::API_BASE_URL.to_string()),
        })
    }

    /// Get the configuration directory, creating it if necessary
    fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::home_dir()
            .ok_or_else(|| {
                OutlookMcpError::Config(ConfigError::DirNotFound {
                    path: "~".to_string(),
                })
            })?
            .join(".outlook-mcp");

        if !config_dir.exists() {
            std::fs::create_dir_all(&config_dir).map_err(|_| {
                OutlookMcpError::Config(ConfigError::DirCreationFailed {
                    path: config_dir.display().to_string(),
                })
            })?;
        }

        Ok(config_dir)
    }

    /// Check if a token cache has been written
    pub fn token_cache_exists(&self) -> bool {
        self.token_cache_path.exists()
    }

    /// Authorization endpoint for the configured tenant
    pub fn authorize_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/authorize", graph::AUTHORITY_HOST, self.tenant_id)
    }

    /// Token endpoint for the configured tenant
    pub fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", graph::AUTHORITY_HOST, self.tenant_id)
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(var: &str, default: T) -> Result<T> {
    match env_non_empty(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| {
            OutlookMcpError::Config(ConfigError::InvalidEnvVar {
                var: var.to_string(),
                value,
            })
        }),
    }
}

/// Split a comma separated scope list, dropping blanks
pub fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Microsoft Graph and identity platform constants
pub mod graph {
    /// Base URL for Graph API v1.0
    pub const API_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

    /// Path segment for the signed-in user
    pub const USER_PATH: &str = "/me";

    /// Identity platform host
    pub const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

    /// Scopes requested when none are configured
    pub const DEFAULT_SCOPES: &[&str] = &[
        "offline_access",
        "User.Read",
        "Mail.ReadWrite",
        "Calendars.ReadWrite",
    ];
}
