//! Asset download port
//!
//! The asset cache never talks to the network directly; it asks an
//! [`AssetFetcher`] for the bytes behind a URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::http::{HttpRequest, HttpTransport, ResilientClient, RetryPolicy};

/// Downloads creative bytes
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetch the full body behind `url`
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Fetcher that downloads over HTTP through [`ResilientClient`]
pub struct HttpAssetFetcher {
    client: ResilientClient,
    policy: RetryPolicy,
}

impl HttpAssetFetcher {
    /// Budget used by [`HttpAssetFetcher::new`]
    pub const DEFAULT_POLICY: RetryPolicy = RetryPolicy {
        timeout: Duration::from_secs(60),
        max_attempts: 2,
        retry_delay: Duration::from_secs(1),
    };

    /// Create a fetcher with the default download budget
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_policy(transport, Self::DEFAULT_POLICY)
    }

    /// Create a fetcher with a custom budget
    pub fn with_policy(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            client: ResilientClient::new(transport),
            policy,
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let outcome = self
            .client
            .request(&HttpRequest::get(url), &self.policy)
            .await?;
        Ok(outcome.response.body)
    }
}
