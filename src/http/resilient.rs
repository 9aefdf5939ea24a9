//! Resilient Client
//!
//! Wraps an [`HttpTransport`] with a per-attempt timeout, a bounded number of
//! attempts and a fixed delay between them. Every failure is classified as
//! retryable or terminal before deciding whether to go again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{Error, Result};

/// Upstream error bodies are cut to this many bytes before being logged
const MAX_ERROR_BODY: usize = 512;

// =============================================================================
// Configuration
// =============================================================================

/// Timeout and retry budget for one kind of outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Budget for a single attempt
    pub timeout: Duration,
    /// Total attempts, including the first (values below 1 are treated as 1)
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy with a single attempt
    pub fn single(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }
}

/// A successful call and what it took to get there
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// The 2xx response
    pub response: HttpResponse,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Wall-clock time across all attempts
    pub elapsed: Duration,
}

// =============================================================================
// Resilient Client
// =============================================================================

/// Retrying HTTP client shared by the decision client, the proof-of-play
/// forwarder and the asset downloader
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient").finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Create a client over the given transport
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Send `request` under `policy`.
    ///
    /// Returns the first 2xx response. Fails with
    /// [`Error::AttemptsExhausted`] wrapping the last classified error as
    /// soon as that error is terminal or the attempt budget is spent.
    pub async fn request(&self, request: &HttpRequest, policy: &RetryPolicy) -> Result<RequestOutcome> {
        let max_attempts = policy.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            match self.attempt(request, policy.timeout).await {
                Ok(response) => {
                    debug!(
                        url = %request.url,
                        attempt,
                        status = response.status,
                        elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                        "Outbound request succeeded"
                    );
                    return Ok(RequestOutcome {
                        response,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(
                        url = %request.url,
                        attempt,
                        max_attempts,
                        retryable,
                        elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                        error = %err,
                        "Outbound request attempt failed"
                    );

                    if !retryable || attempt >= max_attempts {
                        return Err(Error::AttemptsExhausted {
                            attempts: attempt,
                            elapsed: started.elapsed(),
                            source: Box::new(err),
                        });
                    }

                    tokio::time::sleep(policy.retry_delay).await;
                }
            }
        }
    }

    /// One attempt, bounded by `timeout`, with non-2xx mapped to
    /// [`Error::Upstream`]
    async fn attempt(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse> {
        let response = tokio::time::timeout(timeout, self.transport.send(request))
            .await
            .map_err(|_| Error::Timeout { timeout })??;

        if response.is_success() {
            Ok(response)
        } else {
            let mut body = response.text();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(Error::Upstream {
                status: response.status,
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays a script of outcomes, repeating the last one
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<u16>>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<u16>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(vec![Ok(200)].into()),
                delay,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().map(|r| match r {
                        Ok(s) => Ok(*s),
                        Err(e) => Err(Error::Transport(e.to_string())),
                    })
                }
            };
            match next {
                Some(Ok(status)) => Ok(HttpResponse {
                    status,
                    body: Bytes::from(format!("status {}", status)),
                }),
                Some(Err(e)) => Err(e),
                None => Err(Error::Internal("empty script".into())),
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_delay, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(200)]);
        let client = ResilientClient::new(transport.clone());

        let outcome = client
            .request(&HttpRequest::get("http://upstream.test/"), &policy(3))
            .await
            .unwrap();

        assert_eq!(outcome.response.status, 200);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_503_is_retried_until_budget_spent() {
        let transport = ScriptedTransport::new(vec![Ok(503)]);
        let client = ResilientClient::new(transport.clone());

        let err = client
            .request(&HttpRequest::get("http://upstream.test/"), &policy(4))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 4);
        assert_eq!(err.attempts(), Some(4));
        assert!(matches!(err.root(), Error::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_404_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(404)]);
        let client = ResilientClient::new(transport.clone());

        let err = client
            .request(&HttpRequest::get("http://upstream.test/"), &policy(5))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(err.attempts(), Some(1));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let transport = ScriptedTransport::new(vec![
            Ok(502),
            Err(Error::Transport("connection reset".into())),
            Ok(200),
        ]);
        let client = ResilientClient::new(transport.clone());

        let outcome = client
            .request(&HttpRequest::get("http://upstream.test/"), &policy(3))
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_and_reports_attempts() {
        let transport = ScriptedTransport::slow(Duration::from_millis(500));
        let client = ResilientClient::new(transport.clone());
        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
        };

        let err = client
            .request(&HttpRequest::get("http://upstream.test/"), &policy)
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 3);
        assert_eq!(err.attempts(), Some(3));
        assert!(matches!(err.root(), Error::Timeout { .. }));
        assert!(err.elapsed().unwrap() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_zero_attempts_treated_as_one() {
        let transport = ScriptedTransport::new(vec![Ok(500)]);
        let client = ResilientClient::new(transport.clone());

        let err = client
            .request(&HttpRequest::get("http://upstream.test/"), &policy(0))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(err.attempts(), Some(1));
    }
}
