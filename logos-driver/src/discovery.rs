//! Endpoint discovery cache.
//!
//! Wraps the orderer's locate-session call behind a [`SingleFlight`] so
//! that every consumer of one document service shares one discovery
//! result. The delta stream calls [`EndpointDiscovery::invalidate`] before
//! each reconnect, since stale socket endpoints and expired session tokens
//! are the usual reason a connection dropped.
//!
//! Each discovery produces a fresh `Arc<SessionEndpoints>`; a value handed
//! out earlier is never mutated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use url::Url;

use crate::error::{DriverError, Result};
use crate::locator::{DocumentLocator, EndpointKind};
use crate::policies::DriverPolicies;
use crate::rate_limiter::RateLimiter;
use crate::rest::{OrdererApi, RestTarget, SessionResponse};
use crate::single_flight::SingleFlight;
use crate::token::{AuthToken, TokenProvider};

/// Discovered session topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    pub tenant_id: String,
    pub document_id: String,
    pub delta_storage_url: Url,
    pub delta_stream_url: Url,
    pub storage_token: Option<AuthToken>,
    pub socket_token: Option<AuthToken>,
}

impl SessionEndpoints {
    /// Endpoints taken directly from the locator, for backends without a
    /// session-discovery service.
    pub fn from_locator(locator: &DocumentLocator) -> Result<Self> {
        Ok(Self {
            tenant_id: locator.tenant_id().to_string(),
            document_id: locator.require_document_id()?.to_string(),
            delta_storage_url: locator.require(EndpointKind::DeltaStorage)?.clone(),
            delta_stream_url: locator.require(EndpointKind::Orderer)?.clone(),
            storage_token: None,
            socket_token: None,
        })
    }

    fn from_session(session: SessionResponse) -> Result<Self> {
        if session.tenant_id.is_empty() || session.document_id.is_empty() {
            return Err(DriverError::Protocol(
                "session discovery returned an empty tenant or document id".to_string(),
            ));
        }
        Ok(Self {
            delta_storage_url: Url::parse(&session.delta_storage_url)?,
            delta_stream_url: Url::parse(&session.delta_stream_url)?,
            tenant_id: session.tenant_id,
            document_id: session.document_id,
            storage_token: session.tokens.storage,
            socket_token: session.tokens.socket,
        })
    }
}

/// Things a discovery call needs, cloned into each attempt.
#[derive(Clone)]
struct DiscoveryDeps {
    locator: Arc<DocumentLocator>,
    policies: Arc<DriverPolicies>,
    orderer: Arc<dyn OrdererApi>,
    limiter: Arc<RateLimiter>,
    tokens: Arc<dyn TokenProvider>,
    discoveries: Arc<AtomicU64>,
}

impl DiscoveryDeps {
    async fn discover(self) -> Result<Arc<SessionEndpoints>> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);

        if !self.policies.enable_discovery {
            return SessionEndpoints::from_locator(&self.locator).map(Arc::new);
        }

        let tenant_id = self.locator.tenant_id();
        let document_id = self.locator.require_document_id()?;
        let token = self
            .tokens
            .websocket_token(tenant_id, Some(document_id))
            .await?;
        let target = RestTarget::new(self.locator.require(EndpointKind::Orderer)?.clone(), tenant_id)
            .with_document_id(document_id)
            .with_token(token);

        let session = self
            .limiter
            .schedule(self.orderer.locate_session(&target))
            .await?;
        if session.document_id != document_id {
            log::warn!(
                "Session discovery for {tenant_id}/{document_id} answered for document {}",
                session.document_id
            );
        }
        let endpoints = SessionEndpoints::from_session(session)?;
        log::debug!(
            "Discovered session for {}/{}: stream {}",
            endpoints.tenant_id,
            endpoints.document_id,
            endpoints.delta_stream_url
        );
        Ok(Arc::new(endpoints))
    }
}

/// Per-document cache of the current session endpoints.
pub struct EndpointDiscovery {
    flight: SingleFlight<Arc<SessionEndpoints>>,
    discoveries: Arc<AtomicU64>,
}

impl EndpointDiscovery {
    pub fn new(
        locator: Arc<DocumentLocator>,
        policies: Arc<DriverPolicies>,
        orderer: Arc<dyn OrdererApi>,
        limiter: Arc<RateLimiter>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let discoveries = Arc::new(AtomicU64::new(0));
        let deps = DiscoveryDeps {
            locator,
            policies,
            orderer,
            limiter,
            tokens,
            discoveries: discoveries.clone(),
        };
        Self {
            flight: SingleFlight::new(move || deps.clone().discover()),
            discoveries,
        }
    }

    /// The current endpoints, discovering them if nothing is cached.
    ///
    /// Concurrent callers share one discovery call and its outcome.
    pub async fn current_endpoints(&self) -> Result<Arc<SessionEndpoints>> {
        self.flight.get().await
    }

    /// Drop the cached endpoints; the next read performs fresh discovery.
    pub fn invalidate(&self) {
        log::debug!("Invalidating cached session endpoints");
        self.flight.reset();
    }

    /// Endpoints are cached and no call is needed.
    pub fn is_cached(&self) -> bool {
        self.flight.is_settled()
    }

    /// Number of discovery attempts started so far.
    pub fn discovery_count(&self) -> u64 {
        self.discoveries.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EndpointDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDiscovery")
            .field("flight", &self.flight)
            .field("discoveries", &self.discovery_count())
            .finish()
    }
}
