//! Proof-of-Play Forwarder
//!
//! Relays a player's playback confirmation to the URL the decision payload
//! handed out. The URL is opaque; it is only checked for being an absolute
//! http(s) URL.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::http::{HttpRequest, HttpTransport, ResilientClient, RetryPolicy};

/// Shortest per-attempt timeout accepted from configuration
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the forwarder
#[derive(Debug, Clone)]
pub struct ProofOfPlayConfig {
    /// Timeout/retry budget, independent of the decision client's
    pub retry: RetryPolicy,
}

impl Default for ProofOfPlayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                timeout: Duration::from_secs(5),
                max_attempts: 3,
                retry_delay: Duration::from_millis(500),
            },
        }
    }
}

impl ProofOfPlayConfig {
    /// Clamp to the accepted ranges (timeout ≥ 1s, at least one attempt)
    pub fn normalized(mut self) -> Self {
        self.retry.timeout = self.retry.timeout.max(MIN_TIMEOUT);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        self
    }
}

/// What a successful forward took
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardOutcome {
    /// Status the proof-of-play endpoint answered with
    pub http_status: u16,
    /// Wall-clock time across all attempts
    pub elapsed_ms: u64,
    /// Attempts used
    pub attempt_count: u32,
}

/// Forwards proof-of-play callbacks upstream
pub struct ProofOfPlayForwarder {
    config: ProofOfPlayConfig,
    client: ResilientClient,
}

impl std::fmt::Debug for ProofOfPlayForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofOfPlayForwarder")
            .field("retry", &self.config.retry)
            .finish()
    }
}

impl ProofOfPlayForwarder {
    /// Create a forwarder; the configuration is normalized first
    pub fn new(config: ProofOfPlayConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config: config.normalized(),
            client: ResilientClient::new(transport),
        }
    }

    /// Effective retry budget
    pub fn policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Forward one callback.
    ///
    /// An absent or unusable URL fails immediately with
    /// [`Error::InvalidRequest`] and no network attempt. Upstream failures
    /// come back as [`Error::AttemptsExhausted`], carrying attempts and
    /// elapsed time.
    #[instrument(skip(self, url))]
    pub async fn forward(&self, url: Option<&str>) -> Result<ForwardOutcome> {
        let url = validate_url(url)?;
        let request = HttpRequest::get(url)
            .header("Cache-Control", "no-cache")
            .header("Accept", "*/*");

        match self.client.request(&request, &self.config.retry).await {
            Ok(outcome) => {
                let result = ForwardOutcome {
                    http_status: outcome.response.status,
                    elapsed_ms: outcome.elapsed.as_millis() as u64,
                    attempt_count: outcome.attempts,
                };
                info!(
                    status = result.http_status,
                    elapsed_ms = result.elapsed_ms,
                    attempts = result.attempt_count,
                    "Proof-of-play forwarded"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(
                    attempts = err.attempts().unwrap_or(0),
                    elapsed_ms = err.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
                    error = %err,
                    "Proof-of-play forwarding failed"
                );
                Err(err)
            }
        }
    }
}

fn validate_url(url: Option<&str>) -> Result<&str> {
    let url = url
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::InvalidRequest("proof-of-play url is required".to_string()))?;

    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url),
        Ok(parsed) => Err(Error::InvalidRequest(format!(
            "unsupported proof-of-play url scheme: {}",
            parsed.scheme()
        ))),
        Err(e) => Err(Error::InvalidRequest(format!(
            "invalid proof-of-play url: {}",
            e
        ))),
    }
}
