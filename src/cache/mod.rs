//! Caching layers
//!
//! Two independent caches sit between players and the ad-decision API:
//!
//! ```text
//!   player ──► DecisionCache (in memory, TTL, bounded entries)
//!                 │ miss
//!                 ▼
//!            AdDecisionClient ──► AssetCache (on disk, LRU byte budget)
//!                                    │
//!                                    ▼
//!                                AssetFetcher (creative CDN)
//! ```

mod asset;
mod decision;
mod fetcher;
mod record;

pub use asset::{
    parse_size, AssetCache, AssetCacheConfig, AssetCacheStatus, CleanupReport, WarmReport,
};
pub use decision::{DecisionCache, DecisionCacheConfig, DecisionCacheStatus};
pub use fetcher::{AssetFetcher, HttpAssetFetcher};
pub use record::{file_name_for, infer_extension, load_index, write_index, AssetRecord, INDEX_FILE_NAME};
