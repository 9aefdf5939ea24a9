//! Ad Decision Client
//!
//! Builds ad-decision requests for the upstream decisioning API and parses
//! the response envelope. In mock mode it never touches the network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::http::{HttpRequest, HttpTransport, ResilientClient, RetryPolicy};

/// Path of the decision endpoint, relative to the API base URL
pub const DECISION_PATH: &str = "/api/v1/get_ad/json";

/// Path of the asset-listing endpoint, relative to the API base URL
pub const ASSET_MANIFEST_PATH: &str = "/api/v1/get_asset/json";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the decision client
#[derive(Debug, Clone)]
pub struct DecisionClientConfig {
    /// Upstream base URL
    pub api_url: String,

    /// Access credential
    pub api_key: Option<String>,

    /// Network identity
    pub network_id: Option<String>,

    /// Serve synthetic payloads instead of calling upstream
    pub mock: bool,

    /// TTL embedded in synthetic payloads
    pub mock_ttl: Duration,

    /// Venue used when the request carries none
    pub default_venue_id: Option<String>,

    /// Device used when the request carries none
    pub default_device_id: String,

    /// Player model used when the request carries none
    pub default_player_model: String,

    /// Display geometry
    pub display_width: u32,
    pub display_height: u32,

    /// MIME types the players can render
    pub supported_media: Vec<String>,

    /// Timeout/retry budget for decision calls
    pub retry: RetryPolicy,
}

impl Default for DecisionClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://sandbox-api.vistarmedia.com".to_string(),
            api_key: None,
            network_id: None,
            mock: true,
            mock_ttl: Duration::from_secs(60),
            default_venue_id: None,
            default_device_id: "VistarDisplay0".to_string(),
            default_player_model: "ME-DEC".to_string(),
            display_width: 1920,
            display_height: 1080,
            supported_media: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "video/mp4".to_string(),
            ],
            retry: RetryPolicy {
                timeout: Duration::from_secs(5),
                max_attempts: 2,
                retry_delay: Duration::from_millis(250),
            },
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Parameters of one inbound ad request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    /// Display slot being requested
    pub placement_id: String,
    /// Requesting device
    pub device_id: Option<String>,
    /// Venue the device sits in
    pub venue_id: Option<String>,
    /// Player hardware class
    pub player_model: Option<String>,
}

impl DecisionRequest {
    /// Request for a placement with every identifier left to the fallbacks
    pub fn for_placement(placement_id: impl Into<String>) -> Self {
        Self {
            placement_id: placement_id.into(),
            ..Default::default()
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// =============================================================================
// Manifest Port
// =============================================================================

/// Source of asset manifests for cache warmup
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the asset listing for one feed. `Ok(None)` means there is
    /// nothing worth caching (e.g. synthetic upstream).
    async fn fetch_asset_manifest(&self, request: &DecisionRequest) -> Result<Option<Value>>;
}

// =============================================================================
// Decision Client
// =============================================================================

/// Client for the upstream decisioning API
pub struct AdDecisionClient {
    config: DecisionClientConfig,
    client: ResilientClient,
}

impl std::fmt::Debug for AdDecisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdDecisionClient")
            .field("api_url", &self.config.api_url)
            .field("mock", &self.config.mock)
            .finish()
    }
}

impl AdDecisionClient {
    /// Create a new decision client
    pub fn new(config: DecisionClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            client: ResilientClient::new(transport),
        }
    }

    /// Whether synthetic payloads are served
    pub fn is_mock(&self) -> bool {
        self.config.mock
    }

    /// Configuration in use
    pub fn config(&self) -> &DecisionClientConfig {
        &self.config
    }

    /// Fetch a decision for the request's placement
    #[instrument(skip(self, request), fields(placement_id = %request.placement_id))]
    pub async fn fetch_decision(&self, request: &DecisionRequest) -> Result<Value> {
        if self.config.mock {
            debug!("Returning mock decision payload");
            return Ok(self.mock_decision(&request.placement_id));
        }

        let body = self.build_request_body(request)?;
        info!(endpoint = %self.config.api_url, "Fetching ad decision from upstream");
        self.post(DECISION_PATH, body).await
    }

    /// Deterministic synthetic payload for a placement
    pub fn mock_decision(&self, placement_id: &str) -> Value {
        json!({
            "id": format!("mock-{}", placement_id),
            "placementId": placement_id,
            "creative": {
                "html": format!("<div>Mock creative for {}</div>", placement_id)
            },
            "ttlSeconds": self.config.mock_ttl.as_secs(),
            "advertisement": [],
            "mocked": true
        })
    }

    /// Build the JSON body shared by the decision and manifest endpoints.
    ///
    /// Fails with [`Error::Config`] when credentials are missing or no venue
    /// can be resolved, before any network activity.
    pub fn build_request_body(&self, request: &DecisionRequest) -> Result<Value> {
        let (Some(api_key), Some(network_id)) = (
            non_blank(self.config.api_key.as_deref()),
            non_blank(self.config.network_id.as_deref()),
        ) else {
            return Err(Error::Config(
                "Upstream API key and network id are required when mock mode is off".to_string(),
            ));
        };

        let venue_id = non_blank(request.venue_id.as_deref())
            .or_else(|| non_blank(self.config.default_venue_id.as_deref()))
            .ok_or_else(|| {
                Error::Config("venueId is required (no request value or default venue)".to_string())
            })?;
        let device_id = non_blank(request.device_id.as_deref())
            .unwrap_or(self.config.default_device_id.as_str());
        let player_model = non_blank(request.player_model.as_deref())
            .unwrap_or(self.config.default_player_model.as_str());

        Ok(json!({
            "network_id": network_id,
            "api_key": api_key,
            "device_id": device_id,
            "venue_id": venue_id,
            "display_time": Utc::now().timestamp(),
            "direct_connection": false,
            "display_area": [{
                "id": "display-0",
                "width": self.config.display_width,
                "height": self.config.display_height,
                "allow_audio": false,
                "supported_media": self.config.supported_media,
            }],
            "device_attribute": [
                {"name": "PlayerModel", "value": player_model},
                {"name": "PlacementId", "value": request.placement_id},
            ],
        }))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let mut request = HttpRequest::post_json(url, body).header("Accept", "application/json");
        if let Some(key) = non_blank(self.config.api_key.as_deref()) {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let outcome = self.client.request(&request, &self.config.retry).await?;
        debug!(
            attempts = outcome.attempts,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Upstream call completed"
        );
        Ok(parse_envelope(&outcome.response.body))
    }
}

#[async_trait]
impl ManifestSource for AdDecisionClient {
    #[instrument(skip(self, request), fields(placement_id = %request.placement_id))]
    async fn fetch_asset_manifest(&self, request: &DecisionRequest) -> Result<Option<Value>> {
        if self.config.mock {
            return Ok(None);
        }

        let body = self.build_request_body(request)?;
        self.post(ASSET_MANIFEST_PATH, body).await.map(Some)
    }
}

/// Parse a response body, keeping the raw text when it is not JSON
pub fn parse_envelope(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or_else(|e| {
        warn!(error = %e, "Upstream response was not valid JSON, keeping raw body");
        json!({ "raw": String::from_utf8_lossy(body) })
    })
}
