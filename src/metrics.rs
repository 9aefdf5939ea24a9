//! Prometheus metrics
//!
//! All series live in the process-wide default registry and are registered
//! on first touch.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{Error, Result};

/// Ad requests served, by payload source (`cache`, `stub`, `upstream`, `error`)
pub static AD_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adrelay_ad_requests_total",
        "Total number of ad requests",
        &["source"]
    )
    .expect("ad request counter registers once")
});

pub static DECISION_CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "adrelay_decision_cache_hits_total",
        "Decision cache hits"
    )
    .expect("decision cache hit counter registers once")
});

pub static DECISION_CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "adrelay_decision_cache_misses_total",
        "Decision cache misses"
    )
    .expect("decision cache miss counter registers once")
});

/// Upstream calls by operation (`decision`, `manifest`, `proof_of_play`) and result
pub static UPSTREAM_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adrelay_upstream_requests_total",
        "Upstream requests by operation and result",
        &["operation", "result"]
    )
    .expect("upstream counter registers once")
});

/// Proof-of-play callbacks by result
pub static POP_CALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adrelay_proof_of_play_total",
        "Proof-of-play callbacks received",
        &["result"]
    )
    .expect("proof-of-play counter registers once")
});

/// Warm cycles by result (`success`, `partial`, `skipped`)
pub static WARMUP_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adrelay_warmup_cycles_total",
        "Asset cache warm cycles",
        &["result"]
    )
    .expect("warmup counter registers once")
});

/// Asset downloads by result
pub static ASSET_DOWNLOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "adrelay_asset_downloads_total",
        "Creative asset downloads",
        &["result"]
    )
    .expect("asset download counter registers once")
});

pub static ASSET_CACHE_FILES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("adrelay_asset_cache_files", "Files in the asset cache")
        .expect("asset file gauge registers once")
});

pub static ASSET_CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("adrelay_asset_cache_bytes", "Bytes in the asset cache")
        .expect("asset byte gauge registers once")
});

/// Label value for an outcome
pub fn result_label<T, E>(result: &std::result::Result<T, E>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "failure"
    }
}

/// Record the current asset cache size
pub fn set_asset_cache_size(files: usize, bytes: u64) {
    ASSET_CACHE_FILES.set(i64::try_from(files).unwrap_or(i64::MAX));
    ASSET_CACHE_BYTES.set(i64::try_from(bytes).unwrap_or(i64::MAX));
}

/// Force registration so every series is exported from the first scrape
pub fn init() {
    Lazy::force(&AD_REQUESTS);
    Lazy::force(&DECISION_CACHE_HITS);
    Lazy::force(&DECISION_CACHE_MISSES);
    Lazy::force(&UPSTREAM_REQUESTS);
    Lazy::force(&POP_CALLBACKS);
    Lazy::force(&WARMUP_CYCLES);
    Lazy::force(&ASSET_DOWNLOADS);
    Lazy::force(&ASSET_CACHE_FILES);
    Lazy::force(&ASSET_CACHE_BYTES);
}

/// Render the default registry in the Prometheus text format
pub fn gather() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
