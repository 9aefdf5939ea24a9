//! Outbound HTTP
//!
//! A transport port plus the retrying client layered on top of it.
//!
//! ```text
//! AdDecisionClient ─┐
//! ProofOfPlay ──────┼──▶ ResilientClient ──▶ dyn HttpTransport ──▶ network
//! HttpAssetFetcher ─┘     (timeout, retry,     (ReqwestTransport)
//!                          classification)
//! ```

mod resilient;
mod transport;

pub use resilient::{RequestOutcome, ResilientClient, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, USER_AGENT};
