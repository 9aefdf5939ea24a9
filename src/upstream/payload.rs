//! Decision payload helpers
//!
//! Payloads are kept as opaque `serde_json::Value`s; these helpers read the
//! few fields the caches care about.

use std::time::Duration;

use serde_json::Value;

/// Lease-derived TTLs never go below this many seconds
pub const LEASE_TTL_FLOOR_SECS: u64 = 30;

/// Payload-derived TTLs never go above this many seconds (one day)
pub const MAX_TTL_SECS: u64 = 86_400;

/// The `advertisement` array of a decision envelope, or an empty slice
pub fn advertisements(payload: &Value) -> &[Value] {
    payload
        .get("advertisement")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// The `asset_url` of one advertisement entry, if non-empty
pub fn asset_url(ad: &Value) -> Option<&str> {
    ad.get("asset_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
}

/// TTL embedded in the payload by whoever produced it
pub fn embedded_ttl(payload: &Value) -> Option<Duration> {
    let secs = payload.get("ttlSeconds").and_then(Value::as_f64)?;
    (secs >= 1.0).then(|| Duration::from_secs((secs as u64).min(MAX_TTL_SECS)))
}

/// Shortest remaining creative lease, floored at [`LEASE_TTL_FLOOR_SECS`].
///
/// Only entries with a numeric `lease_expiry` still in the future count.
pub fn lease_ttl(payload: &Value, now_epoch_secs: i64) -> Option<Duration> {
    advertisements(payload)
        .iter()
        .filter_map(|ad| ad.get("lease_expiry").and_then(Value::as_f64))
        .map(|expiry| (expiry - now_epoch_secs as f64).floor())
        .filter(|remaining| *remaining > 0.0)
        .map(|remaining| remaining as u64)
        .min()
        .map(|secs| Duration::from_secs(secs.clamp(LEASE_TTL_FLOOR_SECS, MAX_TTL_SECS)))
}

/// TTL to cache a decision for: embedded TTL, else lease-derived, else
/// `default`
pub fn derive_ttl(payload: &Value, now_epoch_secs: i64, default: Duration) -> Duration {
    embedded_ttl(payload)
        .or_else(|| lease_ttl(payload, now_epoch_secs))
        .unwrap_or(default)
}
