//! Bootstrap client error types.

use thiserror::Error;

/// Result type for bootstrap operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Errors that can occur while minting the initial API key.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// HTTP request failed.
    #[error("bootstrap request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The server refused the bootstrap token, or an administrator already exists.
    #[error("bootstrap rejected by server (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The endpoint does not exist (bootstrap disabled or server too old).
    #[error("bootstrap endpoint not found at {url}")]
    EndpointMissing { url: String },

    /// Any other non-2xx response.
    #[error("bootstrap failed with HTTP {status}: {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse response.
    #[error("failed to parse bootstrap response: {0}")]
    ParseError(String),

    /// The bootstrap secret is not valid base64 key material.
    #[error("invalid bootstrap secret: {0}")]
    InvalidSecret(String),

    /// Signing the bootstrap token failed.
    #[error("failed to sign bootstrap token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}
