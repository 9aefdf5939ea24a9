//! Ad request orchestration
//!
//! Ties the caches and upstream clients together for the HTTP handlers:
//! decision cache first, then the upstream (or mock) decision, decorated
//! with local creative copies and cached for its derived TTL.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::cache::{AssetCache, AssetCacheStatus, DecisionCache, DecisionCacheStatus};
use crate::error::{Error, Result};
use crate::metrics;
use crate::upstream::{AdDecisionClient, DecisionRequest, ForwardOutcome, ProofOfPlayForwarder};

/// Where a served payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSource {
    /// Decision cache hit
    Cache,
    /// Synthetic payload (mock upstream)
    Stub,
    /// Fresh upstream decision
    Upstream,
}

impl PayloadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadSource::Cache => "cache",
            PayloadSource::Stub => "stub",
            PayloadSource::Upstream => "upstream",
        }
    }
}

/// Payload handed back to a player
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdResponse {
    pub source: PayloadSource,
    pub payload: Value,
    /// TTL the payload was cached for; absent on cache hits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// Request-facing facade over the caches and upstream clients
#[derive(Clone)]
pub struct AdService {
    decisions: Arc<DecisionCache>,
    client: Arc<AdDecisionClient>,
    assets: Arc<AssetCache>,
    proof_of_play: Arc<ProofOfPlayForwarder>,
}

impl AdService {
    pub fn new(
        decisions: Arc<DecisionCache>,
        client: Arc<AdDecisionClient>,
        assets: Arc<AssetCache>,
        proof_of_play: Arc<ProofOfPlayForwarder>,
    ) -> Self {
        Self {
            decisions,
            client,
            assets,
            proof_of_play,
        }
    }

    pub fn assets(&self) -> &Arc<AssetCache> {
        &self.assets
    }

    pub fn decisions(&self) -> &Arc<DecisionCache> {
        &self.decisions
    }

    /// Serve a decision for one placement.
    ///
    /// Upstream failures propagate to the caller and nothing is cached.
    #[instrument(skip(self, request), fields(placement_id = %request.placement_id))]
    pub async fn serve(&self, request: &DecisionRequest) -> Result<AdResponse> {
        let placement_id = request.placement_id.trim();
        if placement_id.is_empty() {
            return Err(Error::InvalidRequest("placementId is required".to_string()));
        }

        if let Some(payload) = self.decisions.get(placement_id) {
            debug!("Serving decision from cache");
            metrics::DECISION_CACHE_HITS.inc();
            metrics::AD_REQUESTS
                .with_label_values(&[PayloadSource::Cache.as_str()])
                .inc();
            return Ok(AdResponse {
                source: PayloadSource::Cache,
                payload,
                ttl_seconds: None,
            });
        }
        metrics::DECISION_CACHE_MISSES.inc();

        let mock = self.client.is_mock();
        let fetched = self.client.fetch_decision(request).await;
        if !mock {
            metrics::UPSTREAM_REQUESTS
                .with_label_values(&["decision", metrics::result_label(&fetched)])
                .inc();
        }

        let payload = match fetched {
            Ok(payload) => payload,
            Err(e) => {
                metrics::AD_REQUESTS.with_label_values(&["error"]).inc();
                error!(
                    kind = e.kind(),
                    attempts = e.attempts().unwrap_or(0),
                    error = %e,
                    "Failed to fetch ad decision"
                );
                return Err(e);
            }
        };

        let (source, payload) = if mock {
            (PayloadSource::Stub, payload)
        } else {
            (
                PayloadSource::Upstream,
                self.assets.process_ad_payload(payload).await,
            )
        };

        let ttl = self
            .decisions
            .set_with_derived_ttl(placement_id, payload.clone());
        metrics::AD_REQUESTS
            .with_label_values(&[source.as_str()])
            .inc();
        info!(
            source = source.as_str(),
            ttl_secs = ttl.as_secs(),
            "Decision cached"
        );

        Ok(AdResponse {
            source,
            payload,
            ttl_seconds: Some(ttl.as_secs()),
        })
    }

    /// Relay a proof-of-play callback upstream
    #[instrument(skip(self, url))]
    pub async fn forward_proof_of_play(
        &self,
        event_id: &str,
        url: Option<&str>,
    ) -> Result<ForwardOutcome> {
        if event_id.trim().is_empty() {
            metrics::POP_CALLBACKS.with_label_values(&["rejected"]).inc();
            return Err(Error::InvalidRequest("eventId is required".to_string()));
        }

        let result = self.proof_of_play.forward(url).await;
        metrics::POP_CALLBACKS
            .with_label_values(&[metrics::result_label(&result)])
            .inc();
        metrics::UPSTREAM_REQUESTS
            .with_label_values(&["proof_of_play", metrics::result_label(&result)])
            .inc();
        result
    }

    /// Drop one placement's cached decision
    pub fn invalidate(&self, placement_id: &str) -> usize {
        let removed = self.decisions.invalidate(placement_id);
        info!(placement_id, removed, "Decision cache invalidated");
        removed
    }

    /// Drop every cached decision
    pub fn clear_decisions(&self) {
        self.decisions.clear();
        info!("Decision cache cleared");
    }

    pub fn decision_status(&self) -> DecisionCacheStatus {
        self.decisions.status()
    }

    pub fn asset_status(&self) -> AssetCacheStatus {
        self.assets.status()
    }
}
