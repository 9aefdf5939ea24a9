//! AdRelay - caching middleware for digital-signage ad delivery
//!
//! Sits between signage players and an ad-decisioning API. Decisions are
//! cached briefly in memory, the creatives they reference are kept on local
//! disk, and proof-of-play callbacks are relayed upstream with their own
//! retry budget.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           AdRelay                              │
//! ├───────────────────────────────────────────────────────────────┤
//! │  server ──► AdService ──► DecisionCache                        │
//! │                 │                                              │
//! │                 ├──► AdDecisionClient ──► ResilientClient      │
//! │                 ├──► AssetCache ◄── WarmupScheduler            │
//! │                 └──► ProofOfPlayForwarder ──► ResilientClient  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Decision cache and disk-backed asset cache
//! - [`error`] - Error types
//! - [`http`] - Transport port and the retrying client
//! - [`metrics`] - Prometheus metrics
//! - [`server`] - HTTP routes
//! - [`service`] - Request orchestration
//! - [`upstream`] - Ad-decision and proof-of-play clients
//! - [`warmup`] - Background asset cache warmup

pub mod cache;
pub mod error;
pub mod http;
pub mod metrics;
pub mod server;
pub mod service;
pub mod upstream;
pub mod warmup;

// Re-export commonly used types
pub use cache::{AssetCache, AssetCacheConfig, DecisionCache, DecisionCacheConfig};
pub use error::{Error, Result};
pub use service::{AdResponse, AdService, PayloadSource};
pub use upstream::{AdDecisionClient, DecisionRequest, ProofOfPlayForwarder};
pub use warmup::{WarmupConfig, WarmupScheduler};
