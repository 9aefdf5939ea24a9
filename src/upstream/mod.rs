//! Upstream clients
//!
//! The ad-decision API client and the proof-of-play forwarder. Both go
//! through [`crate::http::ResilientClient`] with their own budgets.

mod decision_client;
pub mod payload;
mod proof_of_play;

pub use decision_client::{
    parse_envelope, AdDecisionClient, DecisionClientConfig, DecisionRequest, ManifestSource,
    ASSET_MANIFEST_PATH, DECISION_PATH,
};
pub use proof_of_play::{ForwardOutcome, ProofOfPlayConfig, ProofOfPlayForwarder};
