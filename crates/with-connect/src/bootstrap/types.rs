//! Bootstrap wire types and session credentials.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{BootstrapError, BootstrapResult};

/// Path of Connect's bootstrap endpoint.
pub const BOOTSTRAP_ENDPOINT: &str = "/__api__/v1/experimental/bootstrap";

/// Authorization scheme Connect expects on the bootstrap request.
pub const BOOTSTRAP_AUTH_SCHEME: &str = "Connect-Bootstrap";

/// Audience Connect validates on bootstrap tokens.
pub const BOOTSTRAP_AUDIENCE: &str = "rsconnect";

/// Issuer written into bootstrap tokens.
pub const BOOTSTRAP_ISSUER: &str = "with-connect";

/// Lifetime of a bootstrap token in seconds.
pub const BOOTSTRAP_TOKEN_TTL_SECS: i64 = 5 * 60;

/// Number of random bytes in a bootstrap secret.
const SECRET_LEN: usize = 32;

/// Shared secret the container trusts for bootstrap tokens.
///
/// Generated fresh per session and only ever held in memory.
#[derive(Clone)]
pub struct BootstrapSecret {
    bytes: Vec<u8>,
}

impl BootstrapSecret {
    /// Generate 32 random bytes.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Decode a base64 secret, as passed in `CONNECT_BOOTSTRAP_SECRETKEY`.
    pub fn from_base64(encoded: &str) -> BootstrapResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| BootstrapError::InvalidSecret(e.to_string()))?;
        if bytes.is_empty() {
            return Err(BootstrapError::InvalidSecret("secret is empty".to_string()));
        }
        Ok(Self { bytes })
    }

    /// Base64 form handed to the container.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for BootstrapSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BootstrapSecret(<redacted>)")
    }
}

/// Claims of the HS256 bootstrap token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapClaims {
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: String,
    pub endpoint: String,
    pub method: String,
}

impl BootstrapClaims {
    /// Claims valid for the next five minutes.
    pub fn new() -> Self {
        let now = Utc::now().timestamp();
        Self {
            exp: now + BOOTSTRAP_TOKEN_TTL_SECS,
            iat: now,
            iss: BOOTSTRAP_ISSUER.to_string(),
            aud: BOOTSTRAP_AUDIENCE.to_string(),
            endpoint: BOOTSTRAP_ENDPOINT.to_string(),
            method: "POST".to_string(),
        }
    }
}

impl Default for BootstrapClaims {
    fn default() -> Self {
        Self::new()
    }
}

/// Successful bootstrap response body.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapResponse {
    pub api_key: String,
}

/// Connect API error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub code: Option<i64>,
}

impl ApiErrorResponse {
    /// Human readable message, with Connect's error code when present.
    pub fn describe(&self) -> Option<String> {
        let error = self.error.trim();
        if error.is_empty() {
            return None;
        }
        Some(match self.code {
            Some(code) => format!("{} (code {})", error, code),
            None => error.to_string(),
        })
    }
}

/// Server URL and freshly minted API key for one session.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapCredential {
    pub server_url: String,
    pub api_key: String,
}

impl fmt::Debug for BootstrapCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapCredential")
            .field("server_url", &self.server_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
