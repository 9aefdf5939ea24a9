//! Decision Cache
//!
//! Short-lived in-memory cache of full ad-decision payloads keyed by
//! placement. Entries expire after their TTL; the entry count is bounded and
//! the oldest-inserted entries go first when the bound is exceeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::upstream::payload;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the decision cache
#[derive(Debug, Clone)]
pub struct DecisionCacheConfig {
    /// TTL used when neither the payload nor its leases provide one
    pub default_ttl: Duration,

    /// Maximum number of placements held (0 = unbounded)
    pub max_entries: usize,
}

impl Default for DecisionCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            max_entries: 1000,
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    expires_at: Instant,
    /// Insertion sequence number; lower is older
    inserted: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

impl Store {
    fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&oldest);
        Some(oldest)
    }
}

/// Snapshot returned by [`DecisionCache::status`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCacheStatus {
    /// Placements currently held (sorted)
    pub keys: Vec<String>,
    /// Lookups that returned a payload
    pub hits: u64,
    /// Lookups that returned nothing
    pub misses: u64,
    /// Number of entries
    pub key_count: usize,
    /// Approximate serialized size of all payloads
    pub value_bytes: usize,
    /// Fallback TTL in seconds
    pub default_ttl: u64,
    /// Entry bound (0 = unbounded)
    pub max_entries: usize,
}

// =============================================================================
// Decision Cache
// =============================================================================

/// In-memory TTL cache of decision payloads
#[derive(Debug)]
pub struct DecisionCache {
    config: DecisionCacheConfig,
    store: Mutex<Store>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DecisionCacheConfig::default())
    }
}

impl DecisionCache {
    /// Create a new decision cache
    pub fn new(config: DecisionCacheConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Configured fallback TTL
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Look up a placement. Expired entries are dropped and count as misses.
    pub fn get(&self, placement_id: &str) -> Option<Value> {
        let now = Instant::now();
        let mut store = self.store.lock();

        match store.entries.get(placement_id) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            Some(_) => {
                store.entries.remove(placement_id);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a payload for `ttl` (zero means the default TTL).
    ///
    /// Overwriting counts as a fresh insertion for eviction order. Returns
    /// the placements evicted to stay within `max_entries`.
    pub fn set(&self, placement_id: &str, payload: Value, ttl: Duration) -> Vec<String> {
        let ttl = if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        }
        .min(Duration::from_secs(payload::MAX_TTL_SECS));
        let now = Instant::now();
        let size_bytes = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0);

        let mut store = self.store.lock();
        let inserted = store.next_seq;
        store.next_seq += 1;
        store.entries.insert(
            placement_id.to_string(),
            CacheEntry {
                payload,
                expires_at: now + ttl,
                inserted,
                size_bytes,
            },
        );

        let mut evicted = Vec::new();
        if self.config.max_entries > 0 && store.entries.len() > self.config.max_entries {
            store.remove_expired(now);
            while store.entries.len() > self.config.max_entries {
                match store.evict_oldest() {
                    Some(key) => evicted.push(key),
                    None => break,
                }
            }
        }
        drop(store);

        debug!(
            placement_id,
            ttl_secs = ttl.as_secs(),
            evicted = evicted.len(),
            "Cached decision payload"
        );
        evicted
    }

    /// Store a payload with a TTL derived from the payload itself.
    /// Returns the TTL used.
    pub fn set_with_derived_ttl(&self, placement_id: &str, payload: Value) -> Duration {
        let ttl = payload::derive_ttl(
            &payload,
            chrono::Utc::now().timestamp(),
            self.config.default_ttl,
        );
        self.set(placement_id, payload, ttl);
        ttl
    }

    /// Drop one placement; returns how many entries were removed (0 or 1)
    pub fn invalidate(&self, placement_id: &str) -> usize {
        usize::from(self.store.lock().entries.remove(placement_id).is_some())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.store.lock().entries.clear();
    }

    /// Remove expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.store.lock().remove_expired(Instant::now())
    }

    /// Number of entries, including not-yet-purged expired ones
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of keys, counters and sizes
    pub fn status(&self) -> DecisionCacheStatus {
        let store = self.store.lock();
        let mut keys: Vec<String> = store.entries.keys().cloned().collect();
        keys.sort();

        DecisionCacheStatus {
            key_count: keys.len(),
            value_bytes: store.entries.values().map(|e| e.size_bytes).sum(),
            keys,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            default_ttl: self.config.default_ttl.as_secs(),
            max_entries: self.config.max_entries,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
