//! Error types for the Outlook MCP Server
//!
//! This module defines the error hierarchy for all operations in the server.
//! Only [`AuthError`] is allowed to escape the query layer; vendor
//! communication failures are folded into structured payloads by
//! [`crate::graph::reconcile`].

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the Outlook MCP Server
#[derive(Error, Debug)]
pub enum OutlookMcpError {
    /// Token acquisition or refresh errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Microsoft Graph API errors
    #[error("Graph API error: {0}")]
    Graph(#[from] GraphApiError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// MCP protocol errors
    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Credential acquisition errors.
///
/// These propagate unchanged out of `TokenManager::get_token` and are never
/// converted into tool payloads.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Client ID not configured: set {var}")]
    ClientIdMissing { var: String },

    #[error("Not authenticated: no cached account in {path}")]
    NotAuthenticated { path: String },

    #[error("Token cache {path} holds no expiry for the acquired token")]
    ExpiryUnavailable { path: String },

    #[error("Failed to refresh access token: {message}")]
    TokenRefreshFailed { message: String },

    #[error("OAuth callback error: {message}")]
    CallbackError { message: String },

    #[error("No authorization code provided")]
    NoAuthCode,

    #[error("Consent declined: {message}")]
    ConsentDeclined { message: String },

    #[error("Token exchange failed: {message}")]
    TokenExchangeFailed { message: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Token cache file errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to access token cache {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token cache {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Microsoft Graph API errors
#[derive(Error, Debug)]
pub enum GraphApiError {
    #[error("HTTP error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {message}")]
    Request { message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Continuation token does not belong to {base_url}")]
    ForeignContinuation { base_url: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found: {path}")]
    DirNotFound { path: String },

    #[error("Failed to create config directory: {path}")]
    DirCreationFailed { path: String },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnvVar { var: String, value: String },
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid parameter: {name} - {message}")]
    InvalidParameter { name: String, message: String },
}

/// MCP protocol errors
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid tool arguments: {message}")]
    InvalidArguments { message: String },
}

/// Result type alias for Outlook MCP operations
pub type Result<T> = std::result::Result<T, OutlookMcpError>;

/// Result type alias for credential operations
pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl From<CacheError> for OutlookMcpError {
    fn from(err: CacheError) -> Self {
        OutlookMcpError::Auth(AuthError::Cache(err))
    }
}
