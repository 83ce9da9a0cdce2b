//! Tunable driver limits.
//!
//! Fixed when the factory is built and shared read-only (behind an `Arc`)
//! by every document service it produces. Hosts can deserialize them from
//! JSON; missing fields fall back to [`DriverPolicies::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverPolicies {
    /// Simultaneous storage (blob/tree/summary) requests
    pub max_concurrent_storage_requests: usize,
    /// Simultaneous orderer requests (create, discovery, delta ranges)
    pub max_concurrent_orderer_requests: usize,
    /// Upload summaries as one request instead of blob-by-blob
    pub enable_whole_summary_upload: bool,
    /// Query the session-discovery endpoint; when false, endpoints come
    /// straight from the locator
    pub enable_discovery: bool,
    /// Largest `[from, to)` span requested from delta storage at once
    pub max_ops_per_fetch: u64,
    /// Whole-request timeout for REST calls (None = transport default)
    pub request_timeout_ms: Option<u64>,
    /// Socket open + handshake deadline
    pub connect_timeout_ms: u64,
}

impl Default for DriverPolicies {
    fn default() -> Self {
        Self {
            max_concurrent_storage_requests: 100,
            max_concurrent_orderer_requests: 100,
            enable_whole_summary_upload: false,
            enable_discovery: true,
            max_ops_per_fetch: 2000,
            request_timeout_ms: Some(60_000),
            connect_timeout_ms: 20_000,
        }
    }
}

impl DriverPolicies {
    /// Small limits and short deadlines for tests.
    pub fn for_testing() -> Self {
        Self {
            max_concurrent_storage_requests: 4,
            max_concurrent_orderer_requests: 4,
            enable_whole_summary_upload: false,
            enable_discovery: true,
            max_ops_per_fetch: 10,
            request_timeout_ms: Some(2_000),
            connect_timeout_ms: 2_000,
        }
    }

    /// Parse policies from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let policies: Self = serde_json::from_str(json)?;
        policies.validate()?;
        Ok(policies)
    }

    /// Reject values the driver cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let mut bad = Vec::new();
        if self.max_concurrent_storage_requests == 0 {
            bad.push("maxConcurrentStorageRequests");
        }
        if self.max_concurrent_orderer_requests == 0 {
            bad.push("maxConcurrentOrdererRequests");
        }
        if self.max_ops_per_fetch == 0 {
            bad.push("maxOpsPerFetch");
        }
        if self.connect_timeout_ms == 0 {
            bad.push("connectTimeoutMs");
        }
        if bad.is_empty() {
            Ok(())
        } else {
            Err(DriverError::Configuration(format!(
                "policy values must be positive: {}",
                bad.join(", ")
            )))
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
