//! Connect bootstrap module.
//!
//! Converts a freshly started, credential-less Connect server into one with a
//! usable API key by presenting a token signed with the secret the container
//! was started with.

mod client;
mod error;
mod types;

use async_trait::async_trait;

pub use client::BootstrapClient;
pub use error::{BootstrapError, BootstrapResult};
pub use types::*;

/// Minimal bootstrap abstraction for testability.
#[async_trait]
pub trait BootstrapApi: Send + Sync {
    /// Mint an API key on the server at `base_url`, which trusts `secret`.
    async fn bootstrap(
        &self,
        base_url: &str,
        secret: &BootstrapSecret,
    ) -> BootstrapResult<BootstrapCredential>;
}

#[async_trait]
impl BootstrapApi for BootstrapClient {
    async fn bootstrap(
        &self,
        base_url: &str,
        secret: &BootstrapSecret,
    ) -> BootstrapResult<BootstrapCredential> {
        BootstrapClient::bootstrap(self, base_url, secret).await
    }
}
