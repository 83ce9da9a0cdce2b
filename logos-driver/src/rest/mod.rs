//! Backend REST surface used by the driver.
//!
//! ```text
//! ┌──────────────────┐   orderer limiter   ┌──────────────────────────────┐
//! │ Factory          │ ──────────────────► │ OrdererApi                   │
//! │ EndpointDiscovery│                     │  POST documents/{tenant}     │
//! │ DeltaStorage     │                     │  GET  documents/{t}/session  │
//! └──────────────────┘                     │  GET  {deltaStorage}?from&to │
//!                                          └──────────────────────────────┘
//! ┌──────────────────┐   storage limiter   ┌──────────────────────────────┐
//! │ DocumentStorage  │ ──────────────────► │ StorageApi                   │
//! └──────────────────┘                     │  repos/{tenant}/commits|git  │
//!                                          └──────────────────────────────┘
//! ```
//!
//! The traits are the seam between driver logic and HTTP; [`http`]
//! provides the reqwest implementation.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;
use crate::summary::{QuorumValue, SummaryTree};
use crate::token::AuthToken;

pub use http::HttpBackend;

/// Where a REST call goes and with which credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestTarget {
    pub base_url: Url,
    pub tenant_id: String,
    pub document_id: Option<String>,
    pub token: Option<AuthToken>,
}

impl RestTarget {
    pub fn new(base_url: Url, tenant_id: impl Into<String>) -> Self {
        Self {
            base_url,
            tenant_id: tenant_id.into(),
            document_id: None,
            token: None,
        }
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_token(mut self, token: Option<AuthToken>) -> Self {
        self.token = token;
        self
    }
}

/// Body of `POST /documents/{tenantId}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    /// Omitted when the backend should assign the id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Serialized app subtree
    pub summary: serde_json::Value,
    pub sequence_number: u64,
    pub quorum_values: Vec<QuorumValue>,
}

/// The orderer answers either `{"documentId": ".."}` or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CreateDocumentResponse {
    Object {
        #[serde(rename = "documentId", alias = "id")]
        document_id: String,
    },
    Bare(String),
}

impl CreateDocumentResponse {
    pub fn into_document_id(self) -> String {
        match self {
            Self::Object { document_id } => document_id,
            Self::Bare(id) => id,
        }
    }
}

/// Tokens minted alongside a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    #[serde(default)]
    pub storage: Option<AuthToken>,
    #[serde(default, alias = "websocket")]
    pub socket: Option<AuthToken>,
}

/// Answer of the locate-session call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub tenant_id: String,
    pub document_id: String,
    pub delta_storage_url: String,
    #[serde(alias = "deltaStreamSocketUrl")]
    pub delta_stream_url: String,
    #[serde(default)]
    pub tokens: SessionTokens,
}

/// One sequenced operation of the document's delta stream.
///
/// `contents` is opaque to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOp {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    pub client_id: Option<String>,
    pub client_sequence_number: u64,
    pub reference_sequence_number: u64,
    pub op_type: String,
    pub timestamp: u64,
    pub contents: Vec<u8>,
}

/// A stored snapshot version (a commit in git-backed storage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: String,
    pub tree_id: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// Flat recursive listing returned by `git/trees/{sha}?recursive=1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitTree {
    pub sha: String,
    #[serde(default)]
    pub tree: Vec<GitTreeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitTreeEntry {
    pub path: String,
    pub mode: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub entry_type: String,
}

/// Entry of a `POST git/trees` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateTreeEntry {
    pub path: String,
    pub mode: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub entry_type: String,
}

/// Body of `POST git/summaries` (whole-summary upload).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WholeSummaryUpload {
    #[serde(rename = "type")]
    pub summary_type: String,
    pub message: String,
    pub sequence_number: u64,
    pub tree: SummaryTree,
}

/// Orderer-side REST calls.
#[async_trait]
pub trait OrdererApi: Send + Sync {
    /// Create a document and return the authoritative id.
    async fn create_document(
        &self,
        target: &RestTarget,
        request: &CreateDocumentRequest,
    ) -> Result<String>;

    /// Discover the session topology for `target.document_id`.
    async fn locate_session(&self, target: &RestTarget) -> Result<SessionResponse>;

    /// Fetch sequenced ops in `[from, to)`; `target.base_url` is the
    /// delta-storage URL.
    async fn fetch_deltas(&self, target: &RestTarget, from: u64, to: u64)
        -> Result<Vec<SequencedOp>>;
}

/// Storage-side REST calls (git-backed summary storage).
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn get_versions(&self, target: &RestTarget, count: u32) -> Result<Vec<Version>>;

    async fn get_tree(&self, target: &RestTarget, tree_id: &str) -> Result<GitTree>;

    async fn read_blob(&self, target: &RestTarget, blob_id: &str) -> Result<Vec<u8>>;

    /// Store a blob and return its id.
    async fn create_blob(&self, target: &RestTarget, content: &[u8]) -> Result<String>;

    /// Store a tree and return its id.
    async fn create_tree(&self, target: &RestTarget, entries: &[CreateTreeEntry])
        -> Result<String>;

    /// Upload a complete summary in one request and return its handle.
    async fn upload_summary(&self, target: &RestTarget, upload: &WholeSummaryUpload)
        -> Result<String>;
}
