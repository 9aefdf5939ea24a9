//! Warmup Scheduler
//!
//! Drives the asset cache in the background: one warm cycle right away,
//! then a repeating warm timer and an independent cleanup timer.
//!
//! Stopping cancels the timers only. A cycle or cleanup pass that is
//! already running finishes normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{AssetCache, WarmReport};
use crate::error::Result;
use crate::metrics;

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Period of the warm timer (zero disables it)
    pub update_interval: Duration,
    /// Period of the cleanup timer (zero disables it)
    pub cleanup_interval: Duration,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Warm,
    Cleanup,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Warm => "warm",
            Job::Cleanup => "cleanup",
        }
    }
}

struct Running {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Clears the in-progress flag when a cycle ends, however it ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background driver for [`AssetCache`] warmup and cleanup
pub struct WarmupScheduler {
    cache: Arc<AssetCache>,
    config: WarmupConfig,
    cycle_in_progress: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl WarmupScheduler {
    pub fn new(cache: Arc<AssetCache>, config: WarmupConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            config,
            cycle_in_progress: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    /// Whether the timers are armed
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Load the cache index, kick off the first cycle and arm the timers.
    ///
    /// Returns `false` without doing anything when the cache is disabled.
    /// Never waits for the first cycle.
    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        if !self.cache.is_enabled() {
            debug!("Asset cache disabled, warmup scheduler not started");
            return Ok(false);
        }

        self.cache.ensure_ready().await?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(true);
        }

        if self.cache.targets().is_empty() {
            warn!("Asset cache enabled but no warm targets configured");
        }

        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        let scheduler = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            scheduler.run_warm_cycle().await;
        }));

        for (job, period) in [
            (Job::Warm, self.config.update_interval),
            (Job::Cleanup, self.config.cleanup_interval),
        ] {
            if period.is_zero() {
                debug!(job = job.name(), "Timer disabled");
                continue;
            }
            tasks.push(self.spawn_timer(job, period, token.clone()));
        }

        info!(
            targets = self.cache.targets().len(),
            update_interval_secs = self.config.update_interval.as_secs(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "Warmup scheduler started"
        );
        *running = Some(Running { token, tasks });
        Ok(true)
    }

    fn spawn_timer(
        self: &Arc<Self>,
        job: Job,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(job = job.name(), "Timer stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        match job {
                            Job::Warm => {
                                scheduler.run_warm_cycle().await;
                            }
                            Job::Cleanup => {
                                scheduler.cache.cleanup_stale_entries().await;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Warm every target, then clean up.
    ///
    /// Returns `None` if there is nothing to do or another cycle is
    /// already running.
    pub async fn run_warm_cycle(&self) -> Option<WarmReport> {
        if !self.cache.is_enabled() || self.cache.targets().is_empty() {
            return None;
        }

        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Warm cycle already in progress, skipping");
            metrics::WARMUP_CYCLES.with_label_values(&["skipped"]).inc();
            return None;
        }
        let _guard = CycleGuard(&self.cycle_in_progress);

        let started = Instant::now();
        let report = self.cache.warm_targets(self.cache.targets()).await;
        let cleanup = self.cache.cleanup_stale_entries().await;

        let result = if report.failed == 0 { "success" } else { "partial" };
        metrics::WARMUP_CYCLES.with_label_values(&[result]).inc();
        info!(
            targets = report.targets,
            failed = report.failed,
            assets_cached = report.assets_cached,
            evicted = cleanup.evicted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Warm cycle finished"
        );
        Some(report)
    }

    /// Cancel the timers. Work already underway keeps running.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.token.cancel();
            info!("Warmup scheduler stopped");
        }
    }

    /// Cancel the timers and wait for work already underway to finish
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Warmup task ended abnormally");
            }
        }
        info!("Warmup scheduler shut down");
    }
}

impl Drop for WarmupScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AssetCacheConfig, AssetFetcher};
    use crate::upstream::{DecisionRequest, ManifestSource};
    use crate::warmup::WarmTarget;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    // =========================================================================
    // Stubs
    // =========================================================================

    #[derive(Default)]
    struct CountingManifests {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ManifestSource for CountingManifests {
        async fn fetch_asset_manifest(&self, request: &DecisionRequest) -> Result<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Some(json!({
                "advertisement": [
                    {"asset_url": format!("https://cdn.test/{}.png", request.placement_id)}
                ]
            })))
        }
    }

    struct Bytes4;

    #[async_trait]
    impl AssetFetcher for Bytes4 {
        async fn fetch(&self, _url: &str) -> Result<Bytes> {
            Ok(Bytes::from_static(b"data"))
        }
    }

    fn scheduler(
        dir: &std::path::Path,
        manifests: Arc<CountingManifests>,
        config: WarmupConfig,
        enabled: bool,
    ) -> Arc<WarmupScheduler> {
        let cache = AssetCache::new(
            AssetCacheConfig {
                enabled,
                mock_upstream: false,
                directory: dir.to_path_buf(),
                targets: vec![WarmTarget {
                    placement_id: "lobby".into(),
                    venue_id: "v1".into(),
                    device_id: "d1".into(),
                    player_model: "ME-DEC".into(),
                }],
                ..Default::default()
            },
            Arc::new(Bytes4),
            manifests,
        );
        WarmupScheduler::new(cache, config)
    }

    fn timers_off() -> WarmupConfig {
        WarmupConfig {
            update_interval: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
        }
    }

    async fn wait_for_calls(manifests: &CountingManifests, at_least: usize) {
        for _ in 0..200 {
            if manifests.calls.load(Ordering::SeqCst) >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("manifest source was not called {} times", at_least);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_disabled_cache_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = Arc::new(CountingManifests::default());
        let scheduler = scheduler(dir.path(), manifests.clone(), timers_off(), false);

        assert!(!scheduler.start().await.unwrap());
        assert!(!scheduler.is_running());
        assert_eq!(manifests.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_runs_one_cycle_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = Arc::new(CountingManifests::default());
        let scheduler = scheduler(dir.path(), manifests.clone(), timers_off(), true);

        assert!(scheduler.start().await.unwrap());
        assert!(scheduler.is_running());
        wait_for_calls(&manifests, 1).await;
        scheduler.shutdown().await;

        // timers disabled: nothing beyond the initial cycle
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manifests.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("index.json").exists());
    }

    #[tokio::test]
    async fn test_warm_timer_repeats_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = Arc::new(CountingManifests::default());
        let config = WarmupConfig {
            update_interval: Duration::from_millis(20),
            cleanup_interval: Duration::ZERO,
        };
        let scheduler = scheduler(dir.path(), manifests.clone(), config, true);

        scheduler.start().await.unwrap();
        wait_for_calls(&manifests, 3).await;
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());

        let after_stop = manifests.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manifests.calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = Arc::new(CountingManifests::default());
        let scheduler = scheduler(dir.path(), manifests.clone(), timers_off(), true);

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        wait_for_calls(&manifests, 1).await;
        scheduler.shutdown().await;

        assert_eq!(manifests.calls.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = Arc::new(CountingManifests {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let scheduler = scheduler(dir.path(), manifests.clone(), timers_off(), true);

        let (first, second) = tokio::join!(scheduler.run_warm_cycle(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            scheduler.run_warm_cycle().await
        });

        assert_eq!(first.unwrap().assets_cached, 1);
        assert!(second.is_none());
        assert_eq!(manifests.calls.load(Ordering::SeqCst), 1);

        // the flag is released afterwards
        assert!(scheduler.run_warm_cycle().await.is_some());
    }
}
