//! Asset records and the on-disk index
//!
//! The index is a JSON object keyed by asset URL. It is always rewritten in
//! full: serialized to a uniquely named temp file in the cache directory and
//! renamed over `index.json`.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::Result;

/// File name of the index inside the cache directory
pub const INDEX_FILE_NAME: &str = "index.json";

/// Extension used when none can be inferred from the URL
pub const DEFAULT_EXTENSION: &str = ".bin";

/// One cached creative file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    /// Remote URL the file was downloaded from
    pub asset_url: String,
    /// Local file
    pub file_path: PathBuf,
    /// When the content was stored
    #[serde(default = "Utc::now")]
    pub cached_at: DateTime<Utc>,
    /// Last hit, epoch milliseconds
    #[serde(default)]
    pub last_accessed: i64,
    /// File size in bytes
    #[serde(default)]
    pub size: u64,
    /// Caller-supplied metadata (usually the advertisement entry)
    #[serde(default)]
    pub metadata: Value,
}

impl AssetRecord {
    /// Record for a file stored just now
    pub fn new(asset_url: impl Into<String>, file_path: PathBuf, size: u64, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            asset_url: asset_url.into(),
            file_path,
            cached_at: now,
            last_accessed: now.timestamp_millis(),
            size,
            metadata,
        }
    }

    /// Mark as accessed now
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now().timestamp_millis();
    }

    fn is_well_formed(&self) -> bool {
        !self.asset_url.trim().is_empty() && !self.file_path.as_os_str().is_empty()
    }
}

// =============================================================================
// Content Addressing
// =============================================================================

/// Extension inferred from the URL path (`.mp4`, `.png`, ...), or
/// [`DEFAULT_EXTENSION`]
pub fn infer_extension(asset_url: &str) -> String {
    let Ok(parsed) = url::Url::parse(asset_url) else {
        debug!(asset_url, "Asset URL did not parse, using default extension");
        return DEFAULT_EXTENSION.to_string();
    };

    Path::new(parsed.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Stable file name for a URL: SHA-1 hex of the URL plus its extension
pub fn file_name_for(asset_url: &str) -> String {
    let digest = Sha1::digest(asset_url.as_bytes());
    format!("{}{}", hex::encode(digest), infer_extension(asset_url))
}

// =============================================================================
// Index I/O
// =============================================================================

/// Load the index at `path`.
///
/// A missing file yields an empty map. A corrupt file is logged and also
/// yields an empty map. Individual malformed records are skipped.
pub async fn load_index(path: &Path) -> HashMap<String, AssetRecord> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read asset cache index");
            return HashMap::new();
        }
    };

    let entries: serde_json::Map<String, Value> = match serde_json::from_slice(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Asset cache index is corrupt, starting empty");
            return HashMap::new();
        }
    };

    let mut records = HashMap::with_capacity(entries.len());
    for (key, value) in entries {
        match serde_json::from_value::<AssetRecord>(value) {
            Ok(record) if record.is_well_formed() => {
                records.insert(record.asset_url.clone(), record);
            }
            Ok(_) => debug!(key, "Skipping incomplete index record"),
            Err(e) => debug!(key, error = %e, "Skipping malformed index record"),
        }
    }
    records
}

/// Replace the index at `path` with `records`
pub async fn write_index<'a, I>(path: &Path, records: I) -> Result<()>
where
    I: IntoIterator<Item = &'a AssetRecord>,
{
    let ordered: BTreeMap<&str, &AssetRecord> = records
        .into_iter()
        .map(|record| (record.asset_url.as_str(), record))
        .collect();
    let json = serde_json::to_vec_pretty(&ordered)?;

    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
