//! # logos-driver — Document-service driver for Logos collaboration backends
//!
//! Creates documents on an ordering service and binds per-document
//! services to storage, delta storage and the realtime delta stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────┐  create_container / create_document_service
//! │ DocumentServiceFactory │ ─────────────────────────────────────────┐
//! │  policies, limiters    │                                          ▼
//! └───────────┬────────────┘                              ┌─────────────────┐
//!             │ shared Arc<RateLimiter> × 2               │ DocumentService │
//!             ▼                                           └───────┬─────────┘
//! ┌──────────────────┐     ┌──────────────────┐                   │
//! │ orderer limiter  │     │ storage limiter  │     ┌─────────────┼──────────────┐
//! └────────┬─────────┘     └────────┬─────────┘     ▼             ▼              ▼
//!          │                        │        DeltaStorage   DocumentStorage  DeltaStream
//!          │                        │             │                          Connector
//!          ▼                        ▼             └───────┐          ┌──────────┘
//!     OrdererApi               StorageApi                 ▼          ▼
//!     (reqwest)                (reqwest)          EndpointDiscovery (SingleFlight)
//!                                                          │
//!                                                          ▼
//!                                               SocketTransport (WebSocket)
//! ```
//!
//! ## Modules
//!
//! - [`factory`] — entry point: document creation and service binding
//! - [`document_service`] — per-document facade with lazily built parts
//! - [`discovery`] — single-flight cache of session endpoints
//! - [`single_flight`] — coalesces concurrent identical async calls
//! - [`rate_limiter`] — FIFO-fair bounded concurrency
//! - [`delta_stream`] — realtime connection state machine
//! - [`delta_storage`] — paginated historical op reads
//! - [`storage`] — versions, snapshot trees, blobs and summary upload
//! - [`protocol`] / [`transport`] — bincode socket frames over WebSocket
//! - [`rest`] — backend REST traits and the reqwest implementation
//! - [`locator`], [`summary`], [`token`], [`policies`], [`error`]

pub mod delta_storage;
pub mod delta_stream;
pub mod discovery;
pub mod document_service;
pub mod error;
pub mod factory;
pub mod locator;
pub mod policies;
pub mod protocol;
pub mod rate_limiter;
pub mod rest;
pub mod single_flight;
pub mod storage;
pub mod summary;
pub mod token;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use delta_storage::DeltaStorageService;
pub use delta_stream::{
    ConnectAttempt, ConnectionState, DeltaConnection, DeltaStreamConnector, DeltaStreamEvent,
};
pub use discovery::{EndpointDiscovery, SessionEndpoints};
pub use document_service::{DocumentService, DriverContext};
pub use error::{DriverError, Result};
pub use factory::DocumentServiceFactory;
pub use locator::{DocumentLocator, EndpointKind, ResolvedLocator, NEW_DOCUMENT_ID};
pub use policies::DriverPolicies;
pub use protocol::{ClientDescriptor, ConnectionMode, DocumentMessage, Nack, StreamMessage};
pub use rate_limiter::RateLimiter;
pub use rest::{HttpBackend, OrdererApi, SequencedOp, StorageApi};
pub use single_flight::SingleFlight;
pub use storage::{DocumentStorageService, SnapshotTree};
pub use summary::{CreationSummary, DocumentAttributes, SummaryObject, SummaryTree};
pub use token::{AuthToken, StaticTokenProvider, TokenProvider};
pub use transport::{SocketChannel, SocketTransport, WebSocketTransport};
