//! Per-document service facade.
//!
//! Built by the factory without any network traffic. Storage, delta
//! storage and the delta-stream connector are created on first use and
//! then reused; all three share this service's endpoint discovery cache.

use std::sync::{Arc, OnceLock};

use crate::delta_storage::DeltaStorageService;
use crate::delta_stream::{DeltaConnection, DeltaStreamConnector};
use crate::discovery::EndpointDiscovery;
use crate::error::Result;
use crate::locator::DocumentLocator;
use crate::policies::DriverPolicies;
use crate::protocol::ClientDescriptor;
use crate::rate_limiter::RateLimiter;
use crate::rest::{OrdererApi, StorageApi};
use crate::storage::DocumentStorageService;
use crate::token::TokenProvider;
use crate::transport::SocketTransport;

/// Everything a factory shares with the services it builds.
#[derive(Clone)]
pub struct DriverContext {
    pub policies: Arc<DriverPolicies>,
    pub orderer_limiter: Arc<RateLimiter>,
    pub storage_limiter: Arc<RateLimiter>,
    pub orderer: Arc<dyn OrdererApi>,
    pub storage: Arc<dyn StorageApi>,
    pub transport: Arc<dyn SocketTransport>,
    pub tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("policies", &self.policies)
            .field("orderer_limiter", &self.orderer_limiter)
            .field("storage_limiter", &self.storage_limiter)
            .finish_non_exhaustive()
    }
}

/// Handle to one document's storage, delta storage and delta stream.
pub struct DocumentService {
    locator: Arc<DocumentLocator>,
    context: DriverContext,
    discovery: Arc<EndpointDiscovery>,
    storage: OnceLock<Arc<DocumentStorageService>>,
    delta_storage: OnceLock<Arc<DeltaStorageService>>,
    connector: OnceLock<Arc<DeltaStreamConnector>>,
}

impl DocumentService {
    /// Bind a service to an already validated locator.
    pub(crate) fn new(locator: DocumentLocator, context: DriverContext) -> Self {
        let locator = Arc::new(locator);
        let discovery = Arc::new(EndpointDiscovery::new(
            locator.clone(),
            context.policies.clone(),
            context.orderer.clone(),
            context.orderer_limiter.clone(),
            context.tokens.clone(),
        ));
        Self {
            locator,
            context,
            discovery,
            storage: OnceLock::new(),
            delta_storage: OnceLock::new(),
            connector: OnceLock::new(),
        }
    }

    pub fn locator(&self) -> &DocumentLocator {
        &self.locator
    }

    pub fn policies(&self) -> &DriverPolicies {
        &self.context.policies
    }

    /// The endpoint discovery cache shared by every part of this service.
    pub fn discovery(&self) -> &Arc<EndpointDiscovery> {
        &self.discovery
    }

    /// Summary storage (created on first call).
    pub fn storage(&self) -> Arc<DocumentStorageService> {
        self.storage
            .get_or_init(|| {
                Arc::new(DocumentStorageService::new(
                    self.locator.clone(),
                    self.context.storage.clone(),
                    self.context.storage_limiter.clone(),
                    self.context.tokens.clone(),
                    self.context.policies.clone(),
                ))
            })
            .clone()
    }

    /// Historical op reads (created on first call).
    pub fn delta_storage(&self) -> Arc<DeltaStorageService> {
        self.delta_storage
            .get_or_init(|| {
                Arc::new(DeltaStorageService::new(
                    self.discovery.clone(),
                    self.context.orderer.clone(),
                    self.context.orderer_limiter.clone(),
                    self.context.tokens.clone(),
                    self.context.policies.clone(),
                ))
            })
            .clone()
    }

    /// The connector behind [`connect_to_delta_stream`](Self::connect_to_delta_stream).
    pub fn delta_stream_connector(&self) -> Arc<DeltaStreamConnector> {
        self.connector
            .get_or_init(|| {
                Arc::new(DeltaStreamConnector::new(
                    self.discovery.clone(),
                    self.context.transport.clone(),
                    self.context.tokens.clone(),
                    self.context.policies.clone(),
                ))
            })
            .clone()
    }

    /// Open a realtime connection. Every call after the first refreshes
    /// the discovered endpoints before connecting.
    pub async fn connect_to_delta_stream(&self, client: ClientDescriptor) -> Result<DeltaConnection> {
        self.delta_stream_connector().connect(client).await
    }
}

impl std::fmt::Debug for DocumentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentService")
            .field("tenant_id", &self.locator.tenant_id())
            .field("document_id", &self.locator.document_id())
            .field("discovery", &self.discovery)
            .finish()
    }
}
