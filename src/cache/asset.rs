//! Disk-backed creative asset cache
//!
//! Creatives are downloaded once, stored under a content-addressed file
//! name in a flat directory and tracked in memory by asset URL. The record
//! set is mirrored to `index.json` after every mutation so a restart picks
//! up where the previous process left off.
//!
//! # Concurrency
//!
//! - Record map: `parking_lot::RwLock`, never held across an `.await`.
//! - Downloads: single-flight per URL through a `DashMap` of shared
//!   futures. The download runs in its own task, so it settles (and clears
//!   its map entry) even if every caller goes away.
//! - Index writes: serialized, each one snapshots the record map at write
//!   time.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use super::fetcher::AssetFetcher;
use super::record::{file_name_for, load_index, write_index, AssetRecord, INDEX_FILE_NAME};
use crate::error::{Error, Result};
use crate::metrics;
use crate::upstream::payload::{advertisements, asset_url};
use crate::upstream::ManifestSource;
use crate::warmup::WarmTarget;

type SharedDownload = Shared<BoxFuture<'static, Option<AssetRecord>>>;

// =============================================================================
// Configuration
// =============================================================================

/// Asset cache configuration
#[derive(Debug, Clone)]
pub struct AssetCacheConfig {
    /// Cache requested by the operator
    pub enabled: bool,
    /// Upstream is synthetic; there is nothing real to cache
    pub mock_upstream: bool,
    /// Directory holding the files and `index.json`
    pub directory: PathBuf,
    /// Byte budget enforced by cleanup (0 = unbounded)
    pub max_bytes: u64,
    /// Feeds polled during warmup
    pub targets: Vec<WarmTarget>,
    /// URL prefix cached files are served under
    pub public_prefix: String,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mock_upstream: true,
            directory: PathBuf::from(".cache/vistar/creatives"),
            max_bytes: 0,
            targets: Vec::new(),
            public_prefix: "/cached-assets".to_string(),
        }
    }
}

impl AssetCacheConfig {
    /// Whether the cache does anything at all
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.mock_upstream
    }
}

/// Parse a human size (`"500MB"`, `"1.5 GB"`, `"2048"`) into bytes.
///
/// Units are 1024-based. Anything unparsable is 0, which means unbounded.
pub fn parse_size(value: &str) -> u64 {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return 0;
    }

    if let Ok(bytes) = trimmed.parse::<f64>() {
        return if bytes.is_finite() && bytes > 0.0 {
            bytes.floor() as u64
        } else {
            0
        };
    }

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(split);
    let amount = amount.trim();

    // digits with an optional fractional part, nothing else
    let well_formed = !amount.is_empty()
        && !amount.starts_with('.')
        && !amount.ends_with('.')
        && amount.chars().all(|c| c.is_ascii_digit() || c == '.')
        && amount.matches('.').count() <= 1;
    if !well_formed {
        return 0;
    }

    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        _ => return 0,
    };

    amount
        .parse::<f64>()
        .map(|amount| (amount * multiplier as f64).floor() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Reports
// =============================================================================

/// Snapshot returned by [`AssetCache::status`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCacheStatus {
    pub enabled: bool,
    pub directory: PathBuf,
    pub file_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub targets: Vec<WarmTarget>,
}

/// Outcome of one [`AssetCache::warm_targets`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmReport {
    /// Targets attempted
    pub targets: usize,
    /// Targets whose manifest was fetched
    pub succeeded: usize,
    /// Targets whose manifest fetch failed
    pub failed: usize,
    /// Assets present in the cache after the pass (hits and downloads)
    pub assets_cached: usize,
}

/// Outcome of one [`AssetCache::cleanup_stale_entries`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Records dropped because their file was gone
    pub missing_removed: usize,
    /// Records evicted for the byte budget
    pub evicted: usize,
    /// Bytes released by eviction
    pub freed_bytes: u64,
    /// Total bytes after the pass
    pub total_bytes: u64,
}

// =============================================================================
// Asset Cache
// =============================================================================

/// Disk-backed, single-flight creative cache
pub struct AssetCache {
    config: AssetCacheConfig,
    fetcher: Arc<dyn AssetFetcher>,
    manifests: Arc<dyn ManifestSource>,
    records: RwLock<HashMap<String, AssetRecord>>,
    in_flight: DashMap<String, SharedDownload>,
    ready: OnceCell<()>,
    index_lock: tokio::sync::Mutex<()>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl AssetCache {
    /// Create a cache. Nothing touches the disk until first use.
    pub fn new(
        mut config: AssetCacheConfig,
        fetcher: Arc<dyn AssetFetcher>,
        manifests: Arc<dyn ManifestSource>,
    ) -> Arc<Self> {
        if config.directory.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                config.directory = cwd.join(&config.directory);
            }
        }
        config.directory = normalize(&config.directory);

        Arc::new(Self {
            config,
            fetcher,
            manifests,
            records: RwLock::new(HashMap::new()),
            in_flight: DashMap::new(),
            ready: OnceCell::new(),
            index_lock: tokio::sync::Mutex::new(()),
            last_update: RwLock::new(None),
            last_error: RwLock::new(None),
        })
    }

    /// Whether the cache is active
    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Absolute cache directory
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Configured warm targets
    pub fn targets(&self) -> &[WarmTarget] {
        &self.config.targets
    }

    fn index_path(&self) -> PathBuf {
        self.config.directory.join(INDEX_FILE_NAME)
    }

    /// Create the cache directory and load the index, once.
    ///
    /// A failure is recorded as the last error and the next call retries.
    pub async fn ensure_ready(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let result = self
            .ready
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.config.directory).await?;
                let loaded = load_index(&self.index_path()).await;
                let mut count = 0;
                {
                    let mut records = self.records.write();
                    for (url, record) in loaded {
                        if !self.owns_file(&record.file_path) {
                            warn!(
                                asset_url = %url,
                                path = %record.file_path.display(),
                                "Ignoring index record outside the cache directory"
                            );
                            continue;
                        }
                        count += 1;
                        records.entry(url).or_insert(record);
                    }
                }
                self.publish_size();
                info!(
                    directory = %self.config.directory.display(),
                    records = count,
                    "Asset cache ready"
                );
                Ok::<(), Error>(())
            })
            .await;

        if let Err(ref e) = result {
            error!(
                directory = %self.config.directory.display(),
                error = %e,
                "Asset cache initialization failed"
            );
            self.set_last_error(e.to_string());
        }
        result.map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Lookup and download
    // -------------------------------------------------------------------------

    /// Local copy of `url`, downloading it if needed.
    ///
    /// `None` means the caller should keep using the remote URL: the cache
    /// is disabled or the download failed (logged, never raised).
    pub async fn ensure_asset(self: &Arc<Self>, url: &str, metadata: Value) -> Option<AssetRecord> {
        let url = url.trim();
        if !self.is_enabled() || url.is_empty() {
            return None;
        }
        if self.ensure_ready().await.is_err() {
            return None;
        }

        if let Some(record) = self.cached_asset(url).await {
            return Some(record);
        }
        self.download(url, metadata).await
    }

    /// Existing record for `url`, refreshing its access time.
    ///
    /// A record whose file has vanished is purged and reported as absent.
    pub async fn cached_asset(&self, url: &str) -> Option<AssetRecord> {
        if !self.is_enabled() || self.ensure_ready().await.is_err() {
            return None;
        }

        let path = self.records.read().get(url).map(|r| r.file_path.clone())?;

        if file_exists(&path).await {
            let mut records = self.records.write();
            let record = records.get_mut(url)?;
            record.touch();
            return Some(record.clone());
        }

        let purged = {
            let mut records = self.records.write();
            match records.get(url) {
                Some(record) if record.file_path == path => records.remove(url),
                _ => None,
            }
        };
        if purged.is_some() {
            debug!(asset_url = url, path = %path.display(), "Cached file missing, dropping record");
            self.publish_size();
        }
        None
    }

    async fn download(self: &Arc<Self>, url: &str, metadata: Value) -> Option<AssetRecord> {
        let shared = match self.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) => {
                debug!(asset_url = url, "Joining in-flight download");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // a download may have finished between the lookup and here
                if let Some(record) = self.records.read().get(url) {
                    return Some(record.clone());
                }
                let cache = Arc::clone(self);
                let key = url.to_string();
                let task = tokio::spawn(async move {
                    let record = cache.perform_download(&key, metadata).await;
                    cache.in_flight.remove(&key);
                    record
                });

                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        warn!(error = %e, "Asset download task failed");
                        None
                    })
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        };
        shared.await
    }

    #[instrument(skip_all, fields(asset_url = url))]
    async fn perform_download(&self, url: &str, metadata: Value) -> Option<AssetRecord> {
        let started = Instant::now();
        match self.store(url, metadata).await {
            Ok(record) => {
                metrics::ASSET_DOWNLOADS.with_label_values(&["success"]).inc();
                debug!(
                    path = %record.file_path.display(),
                    size_bytes = record.size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Cached creative asset"
                );
                if let Err(e) = self.persist_index().await {
                    warn!(error = %e, "Failed to persist asset cache index");
                    self.set_last_error(e.to_string());
                }
                Some(record)
            }
            Err(e) => {
                metrics::ASSET_DOWNLOADS.with_label_values(&["failure"]).inc();
                warn!(error = %e, "Creative download failed");
                self.set_last_error(e.to_string());
                None
            }
        }
    }

    async fn store(&self, url: &str, metadata: Value) -> Result<AssetRecord> {
        let body = self.fetcher.fetch(url).await?;
        let path = self.config.directory.join(file_name_for(url));

        // write aside, then rename into place
        let part = path.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&part, &body).await?;
        if let Err(e) = tokio::fs::rename(&part, &path).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }

        let record = AssetRecord::new(url, path, body.len() as u64, metadata);
        self.records
            .write()
            .insert(url.to_string(), record.clone());
        self.publish_size();
        Ok(record)
    }

    /// Rewrite `index.json` from the current record set
    pub async fn persist_index(&self) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let snapshot: Vec<AssetRecord> = self.records.read().values().cloned().collect();
        write_index(&self.index_path(), &snapshot).await
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop records whose files are gone, then evict least recently
    /// accessed files until the byte budget holds. Persists once.
    pub async fn cleanup_stale_entries(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if !self.is_enabled() || self.ensure_ready().await.is_err() {
            return report;
        }

        let snapshot: Vec<(String, PathBuf)> = self
            .records
            .read()
            .iter()
            .map(|(url, record)| (url.clone(), record.file_path.clone()))
            .collect();

        let mut missing = Vec::new();
        for (url, path) in snapshot {
            if !file_exists(&path).await {
                missing.push((url, path));
            }
        }

        let victims: Vec<AssetRecord> = {
            let mut records = self.records.write();
            for (url, path) in &missing {
                if records.get(url).is_some_and(|r| &r.file_path == path) {
                    records.remove(url);
                    report.missing_removed += 1;
                }
            }

            let mut total: u64 = records.values().map(|r| r.size).sum();
            let mut victims = Vec::new();
            if self.config.max_bytes > 0 && total > self.config.max_bytes {
                let mut by_access: Vec<(String, i64)> = records
                    .iter()
                    .map(|(url, r)| (url.clone(), r.last_accessed))
                    .collect();
                by_access.sort_by_key(|(_, accessed)| *accessed);

                for (url, _) in by_access {
                    if total <= self.config.max_bytes {
                        break;
                    }
                    if let Some(record) = records.remove(&url) {
                        total = total.saturating_sub(record.size);
                        victims.push(record);
                    }
                }
            }
            report.total_bytes = total;
            victims
        };

        for record in &victims {
            report.evicted += 1;
            report.freed_bytes += record.size;

            // same URL, same file name: leave a fresh download alone
            let url = record.asset_url.as_str();
            if self.in_flight.contains_key(url) || self.records.read().contains_key(url) {
                debug!(asset_url = url, "Evicted asset was fetched again, keeping file");
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(&record.file_path).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(
                        asset_url = %record.asset_url,
                        error = %e,
                        "Failed to remove evicted asset"
                    );
                }
            }
        }

        if report.missing_removed > 0 || report.evicted > 0 {
            info!(
                missing_removed = report.missing_removed,
                evicted = report.evicted,
                freed_bytes = report.freed_bytes,
                total_bytes = report.total_bytes,
                "Asset cache cleanup"
            );
        }

        if let Err(e) = self.persist_index().await {
            warn!(error = %e, "Failed to persist asset cache index after cleanup");
            self.set_last_error(e.to_string());
        }
        self.publish_size();
        report
    }

    /// Fetch the manifest of every target and cache each creative it
    /// lists. A failing target does not affect the others.
    pub async fn warm_targets(self: &Arc<Self>, targets: &[WarmTarget]) -> WarmReport {
        let mut report = WarmReport {
            targets: targets.len(),
            ..Default::default()
        };
        if !self.is_enabled() {
            return report;
        }
        if self.ensure_ready().await.is_err() {
            report.failed = targets.len();
            return report;
        }

        for target in targets {
            match self.manifests.fetch_asset_manifest(&target.to_request()).await {
                Ok(manifest) => {
                    metrics::UPSTREAM_REQUESTS
                        .with_label_values(&["manifest", "success"])
                        .inc();
                    report.succeeded += 1;

                    let ads = manifest.as_ref().map(advertisements).unwrap_or(&[]);
                    for ad in ads {
                        let Some(url) = asset_url(ad) else { continue };
                        if self.ensure_asset(url, ad.clone()).await.is_some() {
                            report.assets_cached += 1;
                        }
                    }
                }
                Err(e) => {
                    metrics::UPSTREAM_REQUESTS
                        .with_label_values(&["manifest", "failure"])
                        .inc();
                    report.failed += 1;
                    warn!(
                        placement_id = %target.placement_id,
                        venue_id = %target.venue_id,
                        error = %e,
                        "Warm target update failed"
                    );
                    self.set_last_error(e.to_string());
                }
            }
        }

        *self.last_update.write() = Some(Utc::now());
        if report.failed == 0 {
            *self.last_error.write() = None;
        }
        report
    }

    /// Delete every file in the cache directory and write an empty index.
    ///
    /// Files no record points at (orphans of an interrupted download or
    /// index write) go too. Works whether or not the cache is enabled, so an
    /// operator can wipe a directory left behind by an earlier configuration.
    pub async fn clear(&self) -> Result<usize> {
        let directory = &self.config.directory;
        self.records.write().clear();
        if !file_exists_dir(directory).await {
            self.publish_size();
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_name().is_some_and(|name| name == INDEX_FILE_NAME) {
                continue;
            }
            if !entry.file_type().await.is_ok_and(|kind| kind.is_file()) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove cached file"
                ),
            }
        }

        self.persist_index().await?;
        self.publish_size();
        info!(directory = %directory.display(), removed, "Asset cache cleared");
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Payload decoration
    // -------------------------------------------------------------------------

    /// Cache the creative of one advertisement entry and annotate it with
    /// the local copy. Entries that cannot be cached come back unchanged.
    pub async fn ensure_ad_creative(self: &Arc<Self>, ad: Value) -> Value {
        let Some(url) = asset_url(&ad).map(str::to_string) else {
            return ad;
        };
        let Some(record) = self.ensure_asset(&url, ad.clone()).await else {
            return ad;
        };

        let mut ad = ad;
        if let Some(entry) = ad.as_object_mut() {
            entry.insert(
                "cached_asset_path".to_string(),
                Value::String(record.file_path.to_string_lossy().into_owned()),
            );
            entry.insert("cached_asset_bytes".to_string(), Value::from(record.size));
            entry.insert(
                "cache_last_updated".to_string(),
                Value::String(record.cached_at.to_rfc3339()),
            );
        }
        ad
    }

    /// Decorate every advertisement of a decision payload
    pub async fn process_ad_payload(self: &Arc<Self>, payload: Value) -> Value {
        if !self.is_enabled() || advertisements(&payload).is_empty() {
            return payload;
        }

        let mut payload = payload;
        if let Some(ads) = payload
            .get_mut("advertisement")
            .and_then(Value::as_array_mut)
        {
            for ad in ads.iter_mut() {
                let original = std::mem::take(ad);
                *ad = self.ensure_ad_creative(original).await;
            }
        }
        payload
    }

    // -------------------------------------------------------------------------
    // Introspection and serving
    // -------------------------------------------------------------------------

    /// Number of cached files
    pub fn file_count(&self) -> usize {
        self.records.read().len()
    }

    /// Sum of the sizes of all records
    pub fn total_bytes(&self) -> u64 {
        self.records.read().values().map(|r| r.size).sum()
    }

    pub fn status(&self) -> AssetCacheStatus {
        let (file_count, total_bytes): (usize, u64) = {
            let records = self.records.read();
            (records.len(), records.values().map(|r| r.size).sum())
        };

        AssetCacheStatus {
            enabled: self.is_enabled(),
            directory: self.config.directory.clone(),
            file_count,
            total_bytes,
            max_bytes: self.config.max_bytes,
            last_update: *self.last_update.read(),
            last_error: self.last_error.read().clone(),
            targets: self.config.targets.clone(),
        }
    }

    /// Public URL path of the cached copy of `url`.
    ///
    /// Only files that resolve inside the cache directory are exposed.
    pub fn public_asset_path(&self, url: &str) -> Option<String> {
        let path = self.records.read().get(url).map(|r| r.file_path.clone())?;
        let relative = self.relative_to_directory(&path)?;

        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if segments.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}",
            self.config.public_prefix.trim_end_matches('/'),
            segments.join("/")
        ))
    }

    /// Local file behind a public file name, if it belongs to a cached
    /// record
    pub fn resolve_public_file(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return None;
        }

        let candidate = normalize(&self.config.directory.join(name));
        self.relative_to_directory(&candidate)?;

        let known = self
            .records
            .read()
            .values()
            .any(|record| normalize(&record.file_path) == candidate);
        known.then_some(candidate)
    }

    fn relative_to_directory(&self, path: &Path) -> Option<PathBuf> {
        let normalized = normalize(path);
        let relative = normalized.strip_prefix(&self.config.directory).ok()?;
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        (!escapes && !relative.as_os_str().is_empty()).then(|| relative.to_path_buf())
    }

    /// Whether `path` is a cached file this cache may delete
    fn owns_file(&self, path: &Path) -> bool {
        self.relative_to_directory(path)
            .is_some_and(|relative| relative.as_os_str() != INDEX_FILE_NAME)
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    fn publish_size(&self) {
        let (files, bytes): (usize, u64) = {
            let records = self.records.read();
            (records.len(), records.values().map(|r| r.size).sum())
        };
        metrics::set_asset_cache_size(files, bytes);
    }
}

/// Resolve `.` and `..` lexically, without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn file_exists_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::upstream::DecisionRequest;

    // =========================================================================
    // Stubs
    // =========================================================================

    /// Serves `size` bytes per URL, counting calls; URLs containing
    /// `"fail"` return 500
    struct StubFetcher {
        calls: AtomicUsize,
        size: usize,
        delay: Duration,
    }

    impl StubFetcher {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                size,
                delay: Duration::ZERO,
            })
        }

        fn slow(size: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                size,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AssetFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if url.contains("fail") {
                return Err(Error::Upstream {
                    status: 500,
                    body: "boom".into(),
                });
            }
            let size = url
                .rsplit("size=")
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.size);
            Ok(Bytes::from(vec![7u8; size]))
        }
    }

    /// Serves a fixed manifest per placement; placements starting with
    /// `"broken"` fail
    struct StubManifests;

    #[async_trait]
    impl ManifestSource for StubManifests {
        async fn fetch_asset_manifest(&self, request: &DecisionRequest) -> Result<Option<Value>> {
            if request.placement_id.starts_with("broken") {
                return Err(Error::Timeout {
                    timeout: Duration::from_millis(10),
                });
            }
            Ok(Some(json!({
                "advertisement": [
                    {"asset_url": format!("https://cdn.test/{}/a.png", request.placement_id)},
                    {"asset_url": format!("https://cdn.test/{}/b.mp4", request.placement_id)},
                    {"mime_type": "image/png"}
                ]
            })))
        }
    }

    fn config(dir: &Path) -> AssetCacheConfig {
        AssetCacheConfig {
            enabled: true,
            mock_upstream: false,
            directory: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn cache_with(config: AssetCacheConfig, fetcher: Arc<StubFetcher>) -> Arc<AssetCache> {
        AssetCache::new(config, fetcher, Arc::new(StubManifests))
    }

    fn target(placement: &str) -> WarmTarget {
        WarmTarget {
            placement_id: placement.into(),
            venue_id: "v1".into(),
            device_id: "d1".into(),
            player_model: "ME-DEC".into(),
        }
    }

    // =========================================================================
    // Size Parsing
    // =========================================================================

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2048"), 2048);
        assert_eq!(parse_size("500MB"), 500 * 1024 * 1024);
        assert_eq!(parse_size("1.5 kb"), 1536);
        assert_eq!(parse_size("2GB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1TB"), 1 << 40);
        assert_eq!(parse_size(""), 0);
        assert_eq!(parse_size("lots"), 0);
        assert_eq!(parse_size("10 PB"), 0);
        assert_eq!(parse_size("-5"), 0);
        assert_eq!(parse_size("1..5MB"), 0);
    }

    // =========================================================================
    // Download and Lookup
    // =========================================================================

    #[tokio::test]
    async fn test_ensure_asset_downloads_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher::new(12);
        let cache = cache_with(config(dir.path()), fetcher.clone());

        let record = cache
            .ensure_asset("https://cdn.test/clip.mp4", json!({"creative_id": "c1"}))
            .await
            .unwrap();

        assert_eq!(record.size, 12);
        assert_eq!(record.metadata["creative_id"], "c1");
        assert!(record.file_path.starts_with(cache.directory()));
        assert_eq!(
            record.file_path.file_name().unwrap().to_string_lossy(),
            file_name_for("https://cdn.test/clip.mp4")
        );
        assert_eq!(tokio::fs::read(&record.file_path).await.unwrap().len(), 12);

        let index = load_index(&dir.path().join(INDEX_FILE_NAME)).await;
        assert_eq!(index.len(), 1);

        // second call is a hit
        cache.ensure_asset("https://cdn.test/clip.mp4", json!({})).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.total_bytes(), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher::slow(64, Duration::from_millis(100));
        let cache = cache_with(config(dir.path()), fetcher.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache.ensure_asset("https://cdn.test/shared.png", json!({})).await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert_eq!(fetcher.calls(), 1);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher::new(8);
        let cache = cache_with(config(dir.path()), fetcher.clone());

        assert!(cache.ensure_asset("https://cdn.test/fail.png", json!({})).await.is_none());
        assert!(cache.in_flight.is_empty());
        assert!(cache.status().last_error.is_some());

        // not cached, so the next call retries
        assert!(cache.ensure_asset("https://cdn.test/fail.png", json!({})).await.is_none());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_purged_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher::new(8);
        let cache = cache_with(config(dir.path()), fetcher.clone());

        let record = cache.ensure_asset("https://cdn.test/a.png", json!({})).await.unwrap();
        tokio::fs::remove_file(&record.file_path).await.unwrap();

        assert!(cache.cached_asset("https://cdn.test/a.png").await.is_none());
        assert_eq!(cache.file_count(), 0);

        // ensure_asset downloads it again
        assert!(cache.ensure_asset("https://cdn.test/a.png", json!({})).await.is_some());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_restart_reuses_index_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let first = StubFetcher::new(20);
        let cache = cache_with(config(dir.path()), first.clone());
        cache.ensure_asset("https://cdn.test/a.png", json!({"n": 1})).await.unwrap();
        drop(cache);

        let second = StubFetcher::new(20);
        let restarted = cache_with(config(dir.path()), second.clone());
        let record = restarted
            .ensure_asset("https://cdn.test/a.png", json!({}))
            .await
            .unwrap();

        assert_eq!(second.calls(), 0);
        assert_eq!(record.metadata["n"], 1);
        assert_eq!(restarted.total_bytes(), 20);
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    #[tokio::test]
    async fn test_cleanup_evicts_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_bytes = 1000;
        let cache = cache_with(cfg, StubFetcher::new(0));

        let older = cache
            .ensure_asset("https://cdn.test/old.png?size=600", json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let newer = cache
            .ensure_asset("https://cdn.test/new.png?size=500", json!({}))
            .await
            .unwrap();

        let report = cache.cleanup_stale_entries().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.freed_bytes, 600);
        assert_eq!(report.total_bytes, 500);
        assert_eq!(cache.total_bytes(), 500);
        assert!(!older.file_path.exists());
        assert!(newer.file_path.exists());

        let index = load_index(&dir.path().join(INDEX_FILE_NAME)).await;
        assert_eq!(index.len(), 1);
        assert!(index.contains_key("https://cdn.test/new.png?size=500"));
    }

    #[tokio::test]
    async fn test_cleanup_drops_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(10));

        let gone = cache.ensure_asset("https://cdn.test/gone.png", json!({})).await.unwrap();
        cache.ensure_asset("https://cdn.test/kept.png", json!({})).await.unwrap();
        tokio::fs::remove_file(&gone.file_path).await.unwrap();

        let report = cache.cleanup_stale_entries().await;

        assert_eq!(report.missing_removed, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(cache.total_bytes(), 10);
        assert_eq!(load_index(&dir.path().join(INDEX_FILE_NAME)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_unbounded_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(4096));

        cache.ensure_asset("https://cdn.test/a.png", json!({})).await.unwrap();
        cache.ensure_asset("https://cdn.test/b.png", json!({})).await.unwrap();

        let report = cache.cleanup_stale_entries().await;
        assert_eq!(report.evicted, 0);
        assert_eq!(cache.file_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_removes_files_and_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(10));

        let record = cache.ensure_asset("https://cdn.test/a.png", json!({})).await.unwrap();
        let removed = cache.clear().await.unwrap();

        assert_eq!(removed, 1);
        assert!(!record.file_path.exists());
        assert_eq!(cache.file_count(), 0);
        assert!(load_index(&dir.path().join(INDEX_FILE_NAME)).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_orphaned_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(10));

        cache.ensure_asset("https://cdn.test/a.png", json!({})).await.unwrap();
        let orphan = dir.path().join(file_name_for("https://cdn.test/orphan.mp4"));
        tokio::fs::write(&orphan, vec![0u8; 4096]).await.unwrap();
        let stray = dir.path().join("deadbeef.mp4.part");
        tokio::fs::write(&stray, b"partial").await.unwrap();

        let removed = cache.clear().await.unwrap();

        assert_eq!(removed, 3);
        assert!(!orphan.exists());
        assert!(!stray.exists());
        assert!(dir.path().join(INDEX_FILE_NAME).exists());
        assert!(load_index(&dir.path().join(INDEX_FILE_NAME)).await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_keeps_file_being_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_bytes = 1000;
        let cache = cache_with(cfg, StubFetcher::new(0));

        let older = cache
            .ensure_asset("https://cdn.test/old.png?size=600", json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache
            .ensure_asset("https://cdn.test/new.png?size=500", json!({}))
            .await
            .unwrap();

        // a download of the victim is underway and will rewrite the same file
        cache.in_flight.insert(
            older.asset_url.clone(),
            futures::future::pending::<Option<AssetRecord>>().boxed().shared(),
        );
        let report = cache.cleanup_stale_entries().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(cache.total_bytes(), 500);
        assert!(older.file_path.exists());
    }

    #[tokio::test]
    async fn test_index_records_outside_directory_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let precious = elsewhere.path().join("keep.png");
        tokio::fs::write(&precious, b"keep").await.unwrap();

        let planted = [
            AssetRecord::new("https://cdn.test/x.png", precious.clone(), 4, json!({})),
            AssetRecord::new(
                "https://cdn.test/index.png",
                dir.path().join(INDEX_FILE_NAME),
                4,
                json!({}),
            ),
        ];
        write_index(&dir.path().join(INDEX_FILE_NAME), &planted).await.unwrap();

        let mut cfg = config(dir.path());
        cfg.max_bytes = 1;
        let cache = cache_with(cfg, StubFetcher::new(3));
        cache.ensure_ready().await.unwrap();

        assert_eq!(cache.file_count(), 0);
        cache.cleanup_stale_entries().await;
        cache.clear().await.unwrap();
        assert!(precious.exists());
    }

    // =========================================================================
    // Warmup and Decoration
    // =========================================================================

    #[tokio::test]
    async fn test_warm_targets_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher::new(5);
        let cache = cache_with(config(dir.path()), fetcher.clone());

        let report = cache
            .warm_targets(&[target("lobby"), target("broken-feed"), target("hall")])
            .await;

        assert_eq!(report.targets, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.assets_cached, 4);
        assert_eq!(fetcher.calls(), 4);

        let status = cache.status();
        assert_eq!(status.file_count, 4);
        assert!(status.last_update.is_some());
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_successful_warm_clears_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(5));

        cache.warm_targets(&[target("broken")]).await;
        assert!(cache.status().last_error.is_some());

        cache.warm_targets(&[target("lobby")]).await;
        assert!(cache.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_process_ad_payload_decorates_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(9));

        let payload = json!({
            "advertisement": [
                {"id": "1", "asset_url": "https://cdn.test/a.png"},
                {"id": "2", "asset_url": "https://cdn.test/fail.png"},
                {"id": "3"}
            ]
        });
        let decorated = cache.process_ad_payload(payload).await;
        let ads = advertisements(&decorated);

        assert_eq!(ads[0]["cached_asset_bytes"], 9);
        assert!(ads[0]["cached_asset_path"].is_string());
        assert!(ads[0]["cache_last_updated"].is_string());
        assert!(ads[1].get("cached_asset_path").is_none());
        assert_eq!(ads[2], json!({"id": "3"}));
    }

    // =========================================================================
    // Public Paths
    // =========================================================================

    #[tokio::test]
    async fn test_public_asset_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(3));

        let record = cache.ensure_asset("https://cdn.test/a.png", json!({})).await.unwrap();
        let name = record.file_path.file_name().unwrap().to_string_lossy().into_owned();

        assert_eq!(
            cache.public_asset_path("https://cdn.test/a.png"),
            Some(format!("/cached-assets/{}", name))
        );
        assert_eq!(cache.public_asset_path("https://cdn.test/unknown.png"), None);
        assert_eq!(cache.resolve_public_file(&name), Some(record.file_path.clone()));
    }

    #[tokio::test]
    async fn test_public_paths_stay_inside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(config(dir.path()), StubFetcher::new(3));

        // a record pointing outside the directory, e.g. from a tampered index
        cache.records.write().insert(
            "https://cdn.test/evil.png".into(),
            AssetRecord::new(
                "https://cdn.test/evil.png",
                dir.path().join("../outside.png"),
                3,
                json!({}),
            ),
        );

        assert_eq!(cache.public_asset_path("https://cdn.test/evil.png"), None);
        assert_eq!(cache.resolve_public_file("../outside.png"), None);
        assert_eq!(cache.resolve_public_file(".."), None);
        assert_eq!(cache.resolve_public_file(INDEX_FILE_NAME), None);
        assert_eq!(cache.resolve_public_file(""), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/a/../../b")), PathBuf::from("/b"));
    }

    // =========================================================================
    // Disabled Mode
    // =========================================================================

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher::new(3);
        let mut cfg = config(&dir.path().join("never-created"));
        cfg.mock_upstream = true;
        let cache = cache_with(cfg, fetcher.clone());

        assert!(!cache.is_enabled());
        assert!(cache.ensure_asset("https://cdn.test/a.png", json!({})).await.is_none());

        let payload = json!({"advertisement": [{"asset_url": "https://cdn.test/a.png"}]});
        assert_eq!(cache.process_ad_payload(payload.clone()).await, payload);

        let report = cache.warm_targets(&[target("lobby")]).await;
        assert_eq!(report.succeeded, 0);
        assert_eq!(cache.cleanup_stale_entries().await, CleanupReport::default());

        assert_eq!(fetcher.calls(), 0);
        assert!(!dir.path().join("never-created").exists());
        assert!(!cache.status().enabled);
    }
}
