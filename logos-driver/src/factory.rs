//! Entry point of the driver.
//!
//! A factory owns the policies, the two shared request limiters and the
//! backends. It creates new documents on the orderer and binds
//! [`DocumentService`]s to existing ones.
//!
//! Preconditions are checked before any network call: a bad locator or
//! summary never reaches the backend.

use std::sync::Arc;

use crate::document_service::{DocumentService, DriverContext};
use crate::error::{DriverError, Result};
use crate::locator::{DocumentLocator, EndpointKind, ResolvedLocator};
use crate::policies::DriverPolicies;
use crate::rate_limiter::RateLimiter;
use crate::rest::{CreateDocumentRequest, HttpBackend, OrdererApi, RestTarget, StorageApi};
use crate::summary::{CreationSummary, SummaryTree};
use crate::token::TokenProvider;
use crate::transport::{SocketTransport, WebSocketTransport};

/// Builds document services against one backend deployment.
#[derive(Debug, Clone)]
pub struct DocumentServiceFactory {
    context: DriverContext,
}

impl DocumentServiceFactory {
    /// Factory talking HTTP (reqwest) and WebSocket (tokio-tungstenite).
    pub fn new(tokens: Arc<dyn TokenProvider>, policies: DriverPolicies) -> Result<Self> {
        let http = Arc::new(HttpBackend::new(&policies)?);
        Self::with_backends(
            tokens,
            policies,
            http.clone(),
            http,
            Arc::new(WebSocketTransport::new()),
        )
    }

    /// Factory over caller-supplied backends.
    pub fn with_backends(
        tokens: Arc<dyn TokenProvider>,
        policies: DriverPolicies,
        orderer: Arc<dyn OrdererApi>,
        storage: Arc<dyn StorageApi>,
        transport: Arc<dyn SocketTransport>,
    ) -> Result<Self> {
        policies.validate()?;
        log::debug!(
            "Driver factory: {} orderer / {} storage requests in flight",
            policies.max_concurrent_orderer_requests,
            policies.max_concurrent_storage_requests
        );
        Ok(Self {
            context: DriverContext {
                orderer_limiter: Arc::new(RateLimiter::new(
                    policies.max_concurrent_orderer_requests,
                )?),
                storage_limiter: Arc::new(RateLimiter::new(
                    policies.max_concurrent_storage_requests,
                )?),
                policies: Arc::new(policies),
                orderer,
                storage,
                transport,
                tokens,
            },
        })
    }

    pub fn policies(&self) -> &DriverPolicies {
        &self.context.policies
    }

    /// Limiter shared by every orderer request of every service.
    pub fn orderer_limiter(&self) -> &Arc<RateLimiter> {
        &self.context.orderer_limiter
    }

    /// Limiter shared by every storage request of every service.
    pub fn storage_limiter(&self) -> &Arc<RateLimiter> {
        &self.context.storage_limiter
    }

    /// Create a document from `summary` and open a service for it.
    ///
    /// The locator's document id (the `new` sentinel, or a proposed id) is
    /// replaced by the id the orderer assigns.
    pub async fn create_container(
        &self,
        summary: &SummaryTree,
        locator: &ResolvedLocator,
    ) -> Result<DocumentService> {
        let missing = locator.missing_endpoints(&[EndpointKind::Orderer]);
        if !missing.is_empty() {
            return Err(DriverError::missing_endpoints(&missing));
        }
        let creation = CreationSummary::from_tree(summary)?;
        let parsed = DocumentLocator::parse(locator)?;
        let orderer_url = parsed.require(EndpointKind::Orderer)?.clone();

        let tenant_id = parsed.tenant_id();
        let token = self
            .context
            .tokens
            .websocket_token(tenant_id, parsed.document_id())
            .await?;
        let app = serde_json::to_value(&creation.app)
            .map_err(|e| DriverError::Codec(format!("app summary: {e}")))?;
        let request = CreateDocumentRequest {
            id: parsed.document_id().map(str::to_string),
            summary: app,
            sequence_number: creation.attributes.sequence_number,
            quorum_values: creation.quorum_values,
        };
        let target = RestTarget::new(orderer_url, tenant_id).with_token(token);

        log::info!(
            "Creating document in tenant {tenant_id} (proposed id: {:?})",
            request.id
        );
        let document_id = self
            .context
            .orderer_limiter
            .schedule(self.context.orderer.create_document(&target, &request))
            .await
            .map_err(|e| match e {
                DriverError::Api { status, message } => DriverError::Creation { status, message },
                other => other,
            })?;
        if document_id.trim().is_empty() {
            return Err(DriverError::Protocol(
                "orderer returned an empty document id".to_string(),
            ));
        }
        log::info!("Created document {tenant_id}/{document_id}");

        let corrected = parsed.with_document_id(&document_id)?;
        self.create_document_service(&corrected.to_resolved())
    }

    /// Bind a service to an existing document. Makes no network call.
    pub fn create_document_service(&self, locator: &ResolvedLocator) -> Result<DocumentService> {
        let missing =
            locator.missing_endpoints(&[EndpointKind::Orderer, EndpointKind::DeltaStorage]);
        if !missing.is_empty() {
            return Err(DriverError::missing_endpoints(&missing));
        }
        let parsed = DocumentLocator::parse(locator)?;
        parsed.require_document_id()?;
        log::debug!(
            "Document service for {}/{}",
            parsed.tenant_id(),
            parsed.document_id().unwrap_or_default()
        );
        Ok(DocumentService::new(parsed, self.context.clone()))
    }
}
