//! Credentials consumed by the driver.
//!
//! Token issuance lives outside the driver; hosts plug it in through
//! [`TokenProvider`]. A provider may be invoked concurrently and
//! repeatedly. `Ok(None)` means "no auth required or unavailable" and is
//! not an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An opaque bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthToken(<{} bytes>)", self.0.len())
    }
}

/// Supplies storage and realtime-channel credentials on demand.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Token for storage and delta-storage REST calls.
    async fn storage_token(
        &self,
        tenant_id: &str,
        document_id: Option<&str>,
    ) -> Result<Option<AuthToken>>;

    /// Token for the delta-stream socket. Also authorizes orderer REST
    /// calls (document creation, session discovery).
    async fn websocket_token(
        &self,
        tenant_id: &str,
        document_id: Option<&str>,
    ) -> Result<Option<AuthToken>>;
}

/// Hands out fixed tokens regardless of tenant or document.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    storage: Option<AuthToken>,
    websocket: Option<AuthToken>,
}

impl StaticTokenProvider {
    pub fn new(storage: Option<AuthToken>, websocket: Option<AuthToken>) -> Self {
        Self { storage, websocket }
    }

    /// Provider for backends without authentication.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn storage_token(
        &self,
        _tenant_id: &str,
        _document_id: Option<&str>,
    ) -> Result<Option<AuthToken>> {
        Ok(self.storage.clone())
    }

    async fn websocket_token(
        &self,
        _tenant_id: &str,
        _document_id: Option<&str>,
    ) -> Result<Option<AuthToken>> {
        Ok(self.websocket.clone())
    }
}
