//! Connect bootstrap HTTP client.

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::error::{BootstrapError, BootstrapResult};
use super::types::*;

/// Client that mints the first API key of a fresh Connect server.
#[derive(Debug, Clone)]
pub struct BootstrapClient {
    /// HTTP client.
    client: Client,
}

impl BootstrapClient {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new bootstrap client.
    pub fn new(timeout: Duration) -> BootstrapResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Sign a fresh bootstrap token with `secret`.
    pub fn token(secret: &BootstrapSecret) -> BootstrapResult<String> {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &BootstrapClaims::new(),
            &EncodingKey::from_secret(secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Perform the bootstrap exchange against `base_url`.
    ///
    /// Issues exactly one request; any failure is final for the session.
    pub async fn bootstrap(
        &self,
        base_url: &str,
        secret: &BootstrapSecret,
    ) -> BootstrapResult<BootstrapCredential> {
        let base_url = base_url.trim_end_matches('/');
        let url = format!("{}{}", base_url, BOOTSTRAP_ENDPOINT);
        let token = Self::token(secret)?;

        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("{} {}", BOOTSTRAP_AUTH_SCHEME, token),
            )
            .send()
            .await?;

        let body: BootstrapResponse = self.handle_response(&url, response).await?;

        let api_key = body.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(BootstrapError::ParseError(
                "response contained an empty api_key".to_string(),
            ));
        }

        Ok(BootstrapCredential {
            server_url: base_url.to_string(),
            api_key,
        })
    }

    /// Handle response and parse JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        response: reqwest::Response,
    ) -> BootstrapResult<T> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| BootstrapError::ParseError(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&text)
            .ok()
            .and_then(|e| e.describe())
            .unwrap_or_else(|| text.trim().to_string());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BootstrapError::Rejected {
                status: status.as_u16(),
                message,
            }),
            StatusCode::NOT_FOUND => Err(BootstrapError::EndpointMissing {
                url: url.to_string(),
            }),
            _ => Err(BootstrapError::ApiError {
                status: status.as_u16(),
                message,
            }),
        }
    }
}
