//! Error types for AdRelay

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving ads, forwarding proof-of-play
/// callbacks or maintaining the caches
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Request Classification
    // =========================================================================
    /// Missing credential or identifier. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied an unusable request. Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream answered with a non-2xx status
    #[error("Upstream responded with HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    /// A single attempt exceeded its time budget
    #[error("Request timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// Network-level failure (DNS, connect, reset)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The last classified error of a retried call
    #[error("{source} (after {attempts} attempt(s) in {}ms)", .elapsed.as_millis())]
    AttemptsExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Asset cache is turned off
    #[error("Asset cache is disabled")]
    CacheDisabled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether another attempt could succeed.
    ///
    /// Timeouts, transport failures and 5xx responses are retryable;
    /// everything else (4xx, configuration, malformed input) is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Transport(_) => true,
            Error::Upstream { status, .. } => *status >= 500,
            Error::AttemptsExhausted { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Number of attempts made before this error was returned, if it came
    /// out of the retry loop
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::AttemptsExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Wall-clock time spent across all attempts, if known
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Error::AttemptsExhausted { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }

    /// The innermost classified error, skipping the attempt annotation
    pub fn root(&self) -> &Error {
        match self {
            Error::AttemptsExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status a request handler should answer with
    pub fn http_status(&self) -> u16 {
        match self.root() {
            Error::Config(_) | Error::InvalidRequest(_) => 400,
            Error::Timeout { .. } => 504,
            Error::Upstream { .. } | Error::Transport(_) => 502,
            Error::CacheDisabled => 503,
            _ => 500,
        }
    }

    /// Short machine-readable name used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Config(_) => "ConfigurationError",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::Upstream { .. } => "UpstreamError",
            Error::Timeout { .. } => "TimeoutError",
            Error::Transport(_) => "TransportError",
            Error::CacheDisabled => "CacheDisabled",
            Error::Internal(_) | Error::AttemptsExhausted { .. } => "InternalError",
        }
    }
}
