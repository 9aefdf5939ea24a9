//! HTTP Transport Port
//!
//! The narrow seam between the retry logic and the network. Production code
//! uses [`ReqwestTransport`]; tests plug in counting stubs.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method};

use crate::error::{Error, Result};

/// User agent sent on every outbound call
pub const USER_AGENT: &str = concat!("adrelay/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Request / Response
// =============================================================================

/// A single outbound request, independent of the client library
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Optional JSON body
    pub json: Option<serde_json::Value>,
}

impl HttpRequest {
    /// Build a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            json: None,
        }
    }

    /// Build a POST request with a JSON body
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            json: Some(body),
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A fully-read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Sends one request and reads the whole body.
///
/// Implementations report network failures as [`Error::Transport`]. Non-2xx
/// statuses are *not* errors at this layer; classification happens in
/// [`super::ResilientClient`]. Timeouts are applied by the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send the request
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a new transport with a fresh connection pool
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.request(request.method.clone(), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(HttpResponse { status, body })
    }
}
