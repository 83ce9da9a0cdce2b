//! Document locators.
//!
//! [`ResolvedLocator`] is the wire form handed over by the external
//! resolver: plain strings, serde-friendly. [`DocumentLocator`] is the
//! structured form the driver works with: a parsed URL, the tenant and
//! document identity taken from its path, and parsed endpoint URLs.
//!
//! ```text
//!   fluid://host/{tenantId}/{documentId}[/...]
//!                 └─ seg 0 ─┘└── seg 1 ──┘
//! ```
//!
//! A document segment equal to [`NEW_DOCUMENT_ID`] means "let the backend
//! assign an id" and is normalized to `None`.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DriverError, Result};

/// Path sentinel for a document that does not exist yet.
pub const NEW_DOCUMENT_ID: &str = "new";

const TENANT_SEGMENT: usize = 0;
const DOCUMENT_SEGMENT: usize = 1;

/// The backend endpoints a locator may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Orderer,
    Storage,
    DeltaStorage,
}

impl EndpointKind {
    /// Field name used in the serialized locator and in error messages.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Orderer => "ordererUrl",
            Self::Storage => "storageUrl",
            Self::DeltaStorage => "deltaStorageUrl",
        }
    }
}

/// Endpoint URLs as delivered by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatorEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orderer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_storage_url: Option<String>,
}

/// Opaque reference to a document, as produced by an external resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLocator {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default)]
    pub endpoints: LocatorEndpoints,
}

impl ResolvedLocator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_orderer_url(mut self, url: impl Into<String>) -> Self {
        self.endpoints.orderer_url = Some(url.into());
        self
    }

    pub fn with_storage_url(mut self, url: impl Into<String>) -> Self {
        self.endpoints.storage_url = Some(url.into());
        self
    }

    pub fn with_delta_storage_url(mut self, url: impl Into<String>) -> Self {
        self.endpoints.delta_storage_url = Some(url.into());
        self
    }

    /// The endpoint string, if present and not blank.
    pub fn endpoint(&self, kind: EndpointKind) -> Option<&str> {
        let value = match kind {
            EndpointKind::Orderer => &self.endpoints.orderer_url,
            EndpointKind::Storage => &self.endpoints.storage_url,
            EndpointKind::DeltaStorage => &self.endpoints.delta_storage_url,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    /// Wire names of every required endpoint that is absent or blank.
    pub fn missing_endpoints(&self, required: &[EndpointKind]) -> Vec<&'static str> {
        required
            .iter()
            .filter(|kind| self.endpoint(**kind).is_none())
            .map(|kind| kind.wire_name())
            .collect()
    }
}

/// Structured locator: parsed URL, identity and endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLocator {
    url: Url,
    tenant_id: String,
    document_id: Option<String>,
    orderer_url: Option<Url>,
    storage_url: Option<Url>,
    delta_storage_url: Option<Url>,
}

impl DocumentLocator {
    /// Parse the wire form. Endpoints are parsed when present; whether
    /// they are required is the caller's decision.
    pub fn parse(resolved: &ResolvedLocator) -> Result<Self> {
        let url = Url::parse(resolved.url.trim())?;
        let (tenant_id, document_id) = parse_document_path(&url)?;

        if let Some(declared) = resolved.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            if declared != tenant_id {
                return Err(DriverError::Parse(format!(
                    "locator tenant id '{declared}' does not match url path tenant '{tenant_id}'"
                )));
            }
        }

        let declared = resolved
            .document_id
            .as_deref()
            .filter(|d| !d.is_empty() && *d != NEW_DOCUMENT_ID);
        if let Some(declared) = declared {
            if document_id.as_deref() != Some(declared) {
                return Err(DriverError::Parse(format!(
                    "locator document id '{declared}' does not match url path document '{}'",
                    document_id.as_deref().unwrap_or(NEW_DOCUMENT_ID)
                )));
            }
        }

        Ok(Self {
            url,
            tenant_id,
            document_id,
            orderer_url: parse_endpoint(resolved, EndpointKind::Orderer)?,
            storage_url: parse_endpoint(resolved, EndpointKind::Storage)?,
            delta_storage_url: parse_endpoint(resolved, EndpointKind::DeltaStorage)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// `None` while the backend has not assigned an id yet.
    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn endpoint(&self, kind: EndpointKind) -> Option<&Url> {
        match kind {
            EndpointKind::Orderer => self.orderer_url.as_ref(),
            EndpointKind::Storage => self.storage_url.as_ref(),
            EndpointKind::DeltaStorage => self.delta_storage_url.as_ref(),
        }
    }

    /// The endpoint, or a configuration error naming it.
    pub fn require(&self, kind: EndpointKind) -> Result<&Url> {
        self.endpoint(kind)
            .ok_or_else(|| DriverError::missing_endpoints(&[kind.wire_name()]))
    }

    /// The document id, or a parse error.
    pub fn require_document_id(&self) -> Result<&str> {
        self.document_id().ok_or_else(|| {
            DriverError::Parse(format!("locator path has no document id: {}", self.url))
        })
    }

    /// Rebind this locator to the authoritative document id.
    ///
    /// The locator URL gets the id in its document segment. The
    /// delta-storage URL gets it in place of the provisional document
    /// segment, or in its last segment when that segment is not present.
    pub fn with_document_id(&self, document_id: &str) -> Result<Self> {
        if document_id.trim().is_empty() {
            return Err(DriverError::Parse("document id must not be empty".to_string()));
        }
        let delta_storage = self.require(EndpointKind::DeltaStorage)?;

        let mut segs = segments(&self.url)?;
        let slot = segs.get_mut(DOCUMENT_SEGMENT).ok_or_else(|| {
            DriverError::Parse(format!("locator path has no document segment: {}", self.url))
        })?;
        let provisional = std::mem::replace(slot, document_id.to_string());
        let url = with_segments(&self.url, &segs);

        let mut delta_segs = segments(delta_storage)?;
        let index = delta_segs
            .iter()
            .rposition(|seg| *seg == provisional)
            .or_else(|| delta_segs.len().checked_sub(1))
            .ok_or_else(|| {
                DriverError::Parse(format!("deltaStorageUrl has no path: {delta_storage}"))
            })?;
        delta_segs[index] = document_id.to_string();
        let delta_storage_url = with_segments(delta_storage, &delta_segs);

        Ok(Self {
            url,
            tenant_id: self.tenant_id.clone(),
            document_id: Some(document_id.to_string()),
            orderer_url: self.orderer_url.clone(),
            storage_url: self.storage_url.clone(),
            delta_storage_url: Some(delta_storage_url),
        })
    }

    /// Serialize back to the wire form.
    pub fn to_resolved(&self) -> ResolvedLocator {
        ResolvedLocator {
            url: self.url.to_string(),
            tenant_id: Some(self.tenant_id.clone()),
            document_id: self.document_id.clone(),
            endpoints: LocatorEndpoints {
                orderer_url: self.orderer_url.as_ref().map(Url::to_string),
                storage_url: self.storage_url.as_ref().map(Url::to_string),
                delta_storage_url: self.delta_storage_url.as_ref().map(Url::to_string),
            },
        }
    }
}

fn parse_endpoint(resolved: &ResolvedLocator, kind: EndpointKind) -> Result<Option<Url>> {
    resolved
        .endpoint(kind)
        .map(|raw| {
            Url::parse(raw).map_err(|e| {
                DriverError::Parse(format!("invalid {}: {e}", kind.wire_name()))
            })
        })
        .transpose()
}

fn segments(url: &Url) -> Result<Vec<String>> {
    url.path_segments()
        .map(|segs| segs.map(str::to_string).collect())
        .ok_or_else(|| DriverError::Parse(format!("url has no path: {url}")))
}

fn parse_document_path(url: &Url) -> Result<(String, Option<String>)> {
    let segs = segments(url)?;
    let tenant_id = segs
        .get(TENANT_SEGMENT)
        .filter(|s| !s.is_empty())
        .cloned()
        .ok_or_else(|| DriverError::Parse(format!("locator path has no tenant segment: {url}")))?;
    let document = segs
        .get(DOCUMENT_SEGMENT)
        .ok_or_else(|| DriverError::Parse(format!("locator path has no document segment: {url}")))?;

    let document_id = if document.is_empty() || document == NEW_DOCUMENT_ID {
        None
    } else {
        Some(document.clone())
    };
    Ok((tenant_id, document_id))
}

fn with_segments(url: &Url, segs: &[String]) -> Url {
    let mut rewritten = url.clone();
    rewritten.set_path(&format!("/{}", segs.join("/")));
    rewritten
}
