//! Historical op fetches.
//!
//! A `[from, to)` request is split into spans of at most
//! `max_ops_per_fetch` ops. Spans are issued in order through the orderer
//! limiter and reassembled in order; every span answer must stay inside its
//! span and be strictly increasing.

use std::sync::Arc;

use futures_util::future::try_join_all;

use crate::discovery::EndpointDiscovery;
use crate::error::{DriverError, Result};
use crate::policies::DriverPolicies;
use crate::rate_limiter::RateLimiter;
use crate::rest::{OrdererApi, RestTarget, SequencedOp};
use crate::token::TokenProvider;

/// Split `[from, to)` into consecutive spans of at most `max` ops.
pub fn chunk_range(from: u64, to: u64, max: u64) -> Vec<(u64, u64)> {
    let max = max.max(1);
    let mut spans = Vec::new();
    let mut start = from;
    while start < to {
        let end = start.saturating_add(max).min(to);
        spans.push((start, end));
        start = end;
    }
    spans
}

fn check_span(ops: &[SequencedOp], from: u64, to: u64) -> Result<()> {
    let mut previous: Option<u64> = None;
    for op in ops {
        let seq = op.sequence_number;
        if seq < from || seq >= to {
            return Err(DriverError::Protocol(format!(
                "delta storage returned op {seq} outside [{from}, {to})"
            )));
        }
        if previous.is_some_and(|p| seq <= p) {
            return Err(DriverError::Protocol(format!(
                "delta storage returned op {seq} out of order"
            )));
        }
        previous = Some(seq);
    }
    Ok(())
}

/// Reads sequenced ops for one document.
pub struct DeltaStorageService {
    discovery: Arc<EndpointDiscovery>,
    api: Arc<dyn OrdererApi>,
    limiter: Arc<RateLimiter>,
    tokens: Arc<dyn TokenProvider>,
    policies: Arc<DriverPolicies>,
}

impl DeltaStorageService {
    pub fn new(
        discovery: Arc<EndpointDiscovery>,
        api: Arc<dyn OrdererApi>,
        limiter: Arc<RateLimiter>,
        tokens: Arc<dyn TokenProvider>,
        policies: Arc<DriverPolicies>,
    ) -> Self {
        Self {
            discovery,
            api,
            limiter,
            tokens,
            policies,
        }
    }

    /// Fetch ops with `from <= sequence_number < to`.
    ///
    /// The backend may return fewer ops than asked for when the stream has
    /// not reached `to` yet.
    pub async fn get(&self, from: u64, to: u64) -> Result<Vec<SequencedOp>> {
        if from > to {
            return Err(DriverError::Configuration(format!(
                "invalid delta range [{from}, {to})"
            )));
        }
        if from == to {
            return Ok(Vec::new());
        }

        let endpoints = self.discovery.current_endpoints().await?;
        let token = match &endpoints.storage_token {
            Some(token) => Some(token.clone()),
            None => {
                self.tokens
                    .storage_token(&endpoints.tenant_id, Some(&endpoints.document_id))
                    .await?
            }
        };
        let target = RestTarget::new(endpoints.delta_storage_url.clone(), &endpoints.tenant_id)
            .with_document_id(&endpoints.document_id)
            .with_token(token);

        let spans = chunk_range(from, to, self.policies.max_ops_per_fetch);
        log::debug!(
            "Fetching ops [{from}, {to}) for {} in {} span(s)",
            endpoints.document_id,
            spans.len()
        );

        let target = &target;
        let batches = try_join_all(spans.iter().map(|&(start, end)| async move {
            let ops = self
                .limiter
                .schedule(self.api.fetch_deltas(target, start, end))
                .await?;
            check_span(&ops, start, end)?;
            Ok::<_, DriverError>(ops)
        }))
        .await?;

        Ok(batches.into_iter().flatten().collect())
    }
}

impl std::fmt::Debug for DeltaStorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStorageService")
            .field("max_ops_per_fetch", &self.policies.max_ops_per_fetch)
            .finish()
    }
}
