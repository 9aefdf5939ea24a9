//! AdRelay
//!
//! Caching middleware between digital-signage players and an ad-decisioning
//! API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             AdRelay                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    HTTP      │───▶│  AdService   │───▶│   Upstream   │       │
//! │  │   server     │    │  (caches)    │    │   clients    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │                             ▲                                    │
//! │                      ┌──────────────┐                            │
//! │                      │   Warmup     │                            │
//! │                      │  scheduler   │                            │
//! │                      └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use adrelay::cache::{
    parse_size, AssetCache, AssetCacheConfig, DecisionCache, DecisionCacheConfig,
    HttpAssetFetcher,
};
use adrelay::http::{HttpTransport, ReqwestTransport, RetryPolicy};
use adrelay::service::AdService;
use adrelay::upstream::{
    AdDecisionClient, DecisionClientConfig, ProofOfPlayConfig, ProofOfPlayForwarder,
};
use adrelay::warmup::{
    parse_warm_targets, WarmTarget, WarmTargetDefaults, WarmupConfig, WarmupScheduler,
};
use adrelay::{metrics, server};

// =============================================================================
// CLI Arguments
// =============================================================================

/// AdRelay - caching middleware for signage ad delivery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Serve synthetic decisions instead of calling the upstream API
    #[arg(long, env = "MOCK_VISTAR_API", default_value_t = true, action = ArgAction::Set)]
    mock_vistar_api: bool,

    /// Upstream API base URL
    #[arg(
        long,
        env = "VISTAR_API_URL",
        default_value = "https://sandbox-api.vistarmedia.com"
    )]
    vistar_api_url: String,

    /// Upstream API key
    #[arg(long, env = "VISTAR_API_KEY", hide_env_values = true)]
    vistar_api_key: Option<String>,

    /// Upstream network id
    #[arg(long, env = "VISTAR_NETWORK_ID")]
    vistar_network_id: Option<String>,

    /// Venue used when a request carries none
    #[arg(long, env = "DEFAULT_VENUE_ID")]
    default_venue_id: Option<String>,

    /// Device used when a request carries none
    #[arg(long, env = "DEFAULT_DEVICE_ID", default_value = "VistarDisplay0")]
    default_device_id: String,

    /// Player model used when a request carries none
    #[arg(long, env = "DEFAULT_PLAYER_MODEL", default_value = "ME-DEC")]
    default_player_model: String,

    /// Placement prefix for warm targets that omit one
    #[arg(
        long,
        env = "CACHE_DEFAULT_PLACEMENT_ID",
        default_value = "creative-cache-default"
    )]
    cache_default_placement_id: String,

    /// Display width in pixels
    #[arg(long, env = "DISPLAY_WIDTH", default_value = "1920")]
    display_width: u32,

    /// Display height in pixels
    #[arg(long, env = "DISPLAY_HEIGHT", default_value = "1080")]
    display_height: u32,

    /// Per-attempt timeout for decision calls (ms)
    #[arg(long, env = "VISTAR_TIMEOUT_MS", default_value = "5000")]
    vistar_timeout_ms: u64,

    /// Attempts per decision call
    #[arg(long, env = "VISTAR_MAX_RETRIES", default_value = "2")]
    vistar_max_retries: u32,

    /// Pause between decision attempts (ms)
    #[arg(long, env = "VISTAR_RETRY_DELAY_MS", default_value = "250")]
    vistar_retry_delay_ms: u64,

    /// Per-attempt timeout for proof-of-play calls (ms, at least 1000)
    #[arg(long, env = "POP_FORWARD_TIMEOUT_MS", default_value = "5000")]
    pop_forward_timeout_ms: u64,

    /// Attempts per proof-of-play call (at least 1)
    #[arg(long, env = "POP_FORWARD_MAX_RETRIES", default_value = "3")]
    pop_forward_max_retries: u32,

    /// Pause between proof-of-play attempts (ms)
    #[arg(long, env = "POP_FORWARD_RETRY_DELAY_MS", default_value = "500")]
    pop_forward_retry_delay_ms: u64,

    /// Fallback decision TTL in seconds
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value = "60")]
    cache_ttl_seconds: u64,

    /// Maximum cached decisions (0 = unbounded)
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value = "1000")]
    cache_max_entries: usize,

    /// Enable the on-disk creative cache (ignored in mock mode)
    #[arg(long, env = "CACHE_ENABLED", default_value_t = true, action = ArgAction::Set)]
    cache_enabled: bool,

    /// Creative cache directory
    #[arg(long, env = "CACHE_DIR", default_value = ".cache/vistar/creatives")]
    cache_dir: PathBuf,

    /// Creative cache byte budget, e.g. "500MB" (0 = unbounded)
    #[arg(long, env = "CACHE_MAX_SIZE", default_value = "0")]
    cache_max_size: String,

    /// Warm cycle period (ms, 0 disables)
    #[arg(long, env = "CACHE_UPDATE_INTERVAL", default_value = "3600000")]
    cache_update_interval: u64,

    /// Cleanup period (ms, 0 disables)
    #[arg(long, env = "CACHE_CLEANUP_INTERVAL", default_value = "86400000")]
    cache_cleanup_interval: u64,

    /// Warm targets: "placement:venue:device:model,..." or "off"
    #[arg(long, env = "CACHE_WARMUP_TARGETS")]
    cache_warmup_targets: Option<String>,

    /// Listen host
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Run one warm cycle and exit
    Warmup {
        /// Targets to warm instead of the configured ones
        targets: Vec<String>,
    },
    /// Delete every cached creative and exit
    ClearCache,
}

impl Args {
    fn decision_config(&self) -> DecisionClientConfig {
        DecisionClientConfig {
            api_url: self.vistar_api_url.clone(),
            api_key: self.vistar_api_key.clone(),
            network_id: self.vistar_network_id.clone(),
            mock: self.mock_vistar_api,
            mock_ttl: Duration::from_secs(self.cache_ttl_seconds),
            default_venue_id: self.default_venue_id.clone(),
            default_device_id: self.default_device_id.clone(),
            default_player_model: self.default_player_model.clone(),
            display_width: self.display_width,
            display_height: self.display_height,
            retry: RetryPolicy {
                timeout: Duration::from_millis(self.vistar_timeout_ms),
                max_attempts: self.vistar_max_retries,
                retry_delay: Duration::from_millis(self.vistar_retry_delay_ms),
            },
            ..Default::default()
        }
    }

    fn proof_of_play_config(&self) -> ProofOfPlayConfig {
        ProofOfPlayConfig {
            retry: RetryPolicy {
                timeout: Duration::from_millis(self.pop_forward_timeout_ms),
                max_attempts: self.pop_forward_max_retries,
                retry_delay: Duration::from_millis(self.pop_forward_retry_delay_ms),
            },
        }
    }

    fn decision_cache_config(&self) -> DecisionCacheConfig {
        DecisionCacheConfig {
            default_ttl: Duration::from_secs(self.cache_ttl_seconds),
            max_entries: self.cache_max_entries,
        }
    }

    fn warm_targets(&self, overrides: &[String]) -> Vec<WarmTarget> {
        let defaults = WarmTargetDefaults {
            placement_id: self.cache_default_placement_id.clone(),
            venue_id: self.default_venue_id.clone(),
            device_id: Some(self.default_device_id.clone()),
            player_model: self.default_player_model.clone(),
        };
        if overrides.is_empty() {
            parse_warm_targets(self.cache_warmup_targets.as_deref(), &defaults)
        } else {
            parse_warm_targets(Some(&overrides.join(",")), &defaults)
        }
    }

    fn asset_cache_config(&self, targets: Vec<WarmTarget>) -> AssetCacheConfig {
        AssetCacheConfig {
            enabled: self.cache_enabled,
            mock_upstream: self.mock_vistar_api,
            directory: self.cache_dir.clone(),
            max_bytes: parse_size(&self.cache_max_size),
            targets,
            ..Default::default()
        }
    }

    fn warmup_config(&self) -> WarmupConfig {
        WarmupConfig {
            update_interval: Duration::from_millis(self.cache_update_interval),
            cleanup_interval: Duration::from_millis(self.cache_cleanup_interval),
        }
    }

    fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("No address for {}:{}", self.host, self.port))
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let command = args.command.clone().unwrap_or(Command::Serve);
    let overrides = match &command {
        Command::Warmup { targets } => targets.clone(),
        _ => Vec::new(),
    };

    info!("Starting AdRelay {}", env!("CARGO_PKG_VERSION"));
    info!("  Mock upstream: {}", args.mock_vistar_api);
    info!("  Upstream URL: {}", args.vistar_api_url);
    info!("  Cache directory: {}", args.cache_dir.display());

    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new().context("Failed to build HTTP client")?);

    let client = Arc::new(AdDecisionClient::new(
        args.decision_config(),
        transport.clone(),
    ));
    let assets = AssetCache::new(
        args.asset_cache_config(args.warm_targets(&overrides)),
        Arc::new(HttpAssetFetcher::new(transport.clone())),
        client.clone(),
    );

    match command {
        Command::Serve => serve(&args, transport, client, assets).await,
        Command::Warmup { .. } => warmup(assets).await,
        Command::ClearCache => {
            let removed = assets.clear().await.context("Failed to clear asset cache")?;
            info!(removed, "Asset cache cleared");
            Ok(())
        }
    }
}

async fn serve(
    args: &Args,
    transport: Arc<dyn HttpTransport>,
    client: Arc<AdDecisionClient>,
    assets: Arc<AssetCache>,
) -> anyhow::Result<()> {
    metrics::init();

    let service = AdService::new(
        Arc::new(DecisionCache::new(args.decision_cache_config())),
        client,
        assets.clone(),
        Arc::new(ProofOfPlayForwarder::new(
            args.proof_of_play_config(),
            transport,
        )),
    );

    if args.cache_enabled && args.mock_vistar_api {
        warn!("Creative cache requested but disabled because the upstream is mocked");
    }

    let scheduler = WarmupScheduler::new(assets, args.warmup_config());
    if let Err(e) = scheduler.start().await {
        error!("Warmup scheduler failed to start: {}", e);
    }

    // Shut down on Ctrl-C
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let result = server::run(args.listen_addr()?, service, shutdown).await;
    scheduler.shutdown().await;

    info!("AdRelay shutdown complete");
    result.context("HTTP server failed")
}

async fn warmup(assets: Arc<AssetCache>) -> anyhow::Result<()> {
    if !assets.is_enabled() {
        warn!("Asset cache is disabled (mock upstream or CACHE_ENABLED=false), nothing to warm");
        return Ok(());
    }
    if assets.targets().is_empty() {
        warn!("No warm targets configured");
        return Ok(());
    }

    assets
        .ensure_ready()
        .await
        .context("Failed to prepare asset cache")?;
    let report = assets.warm_targets(assets.targets()).await;
    let cleanup = assets.cleanup_stale_entries().await;

    info!(
        targets = report.targets,
        succeeded = report.succeeded,
        failed = report.failed,
        assets_cached = report.assets_cached,
        evicted = cleanup.evicted,
        total_bytes = cleanup.total_bytes,
        "Warmup complete"
    );
    if report.failed > 0 {
        anyhow::bail!("{} of {} warm targets failed", report.failed, report.targets);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_surface() {
        let args = Args::try_parse_from(["adrelay"]).unwrap();

        assert!(args.mock_vistar_api);
        assert!(args.cache_enabled);
        assert_eq!(args.port, 3000);

        let decision = args.decision_config();
        assert_eq!(decision.retry.max_attempts, 2);
        assert_eq!(decision.retry.retry_delay, Duration::from_millis(250));

        let pop = args.proof_of_play_config();
        assert_eq!(pop.retry.max_attempts, 3);

        let assets = args.asset_cache_config(Vec::new());
        assert_eq!(assets.max_bytes, 0);
        assert!(!assets.is_enabled());

        let warmup = args.warmup_config();
        assert_eq!(warmup.update_interval, Duration::from_secs(3600));
        assert_eq!(warmup.cleanup_interval, Duration::from_secs(86400));
    }

    #[test]
    fn test_subcommands_parse() {
        let args = Args::try_parse_from([
            "adrelay",
            "--mock-vistar-api",
            "false",
            "--cache-max-size",
            "1GB",
            "warmup",
            "lobby:v1:d1:ME-DEC",
        ])
        .unwrap();

        assert!(!args.mock_vistar_api);
        assert_eq!(parse_size(&args.cache_max_size), 1 << 30);
        match &args.command {
            Some(Command::Warmup { targets }) => {
                let parsed = args.warm_targets(targets);
                assert_eq!(parsed.len(), 1);
                assert_eq!(parsed[0].venue_id, "v1");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
