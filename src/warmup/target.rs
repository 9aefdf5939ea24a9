//! Warm targets
//!
//! A warm target names one upstream creative feed (placement, venue, device,
//! player model) polled to pre-populate the asset cache. Targets are
//! configured as `placement:venue:device:model` entries separated by commas.

use serde::{Deserialize, Serialize};

use crate::upstream::DecisionRequest;

/// Values that turn warmup off entirely
const DISABLED_MARKERS: [&str; 3] = ["disabled", "none", "off"];

/// One creative feed to poll during warmup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmTarget {
    pub placement_id: String,
    pub venue_id: String,
    pub device_id: String,
    pub player_model: String,
}

impl WarmTarget {
    /// Upstream request parameters for this feed
    pub fn to_request(&self) -> DecisionRequest {
        DecisionRequest {
            placement_id: self.placement_id.clone(),
            device_id: Some(self.device_id.clone()),
            venue_id: Some(self.venue_id.clone()),
            player_model: Some(self.player_model.clone()),
        }
    }
}

/// Fallbacks for segments left empty in a target entry
#[derive(Debug, Clone)]
pub struct WarmTargetDefaults {
    /// Placement prefix; numbered per entry when one omits it
    pub placement_id: String,
    pub venue_id: Option<String>,
    pub device_id: Option<String>,
    pub player_model: String,
}

impl Default for WarmTargetDefaults {
    fn default() -> Self {
        Self {
            placement_id: "creative-cache-default".to_string(),
            venue_id: None,
            device_id: Some("VistarDisplay0".to_string()),
            player_model: "ME-DEC".to_string(),
        }
    }
}

fn segment(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse a target list.
///
/// - `None`/blank: a single default target if a default venue and device
///   exist, otherwise nothing.
/// - `off`, `none`, `disabled`: nothing.
/// - Entries that cannot resolve a venue and device are dropped.
pub fn parse_warm_targets(raw: Option<&str>, defaults: &WarmTargetDefaults) -> Vec<WarmTarget> {
    let default_venue = segment(defaults.venue_id.as_deref());
    let default_device = segment(defaults.device_id.as_deref());

    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return match (default_venue, default_device) {
            (Some(venue_id), Some(device_id)) => vec![WarmTarget {
                placement_id: defaults.placement_id.clone(),
                venue_id,
                device_id,
                player_model: defaults.player_model.clone(),
            }],
            _ => Vec::new(),
        };
    };

    if DISABLED_MARKERS.contains(&raw.to_ascii_lowercase().as_str()) {
        return Vec::new();
    }

    raw.split(',')
        .enumerate()
        .filter_map(|(index, entry)| {
            let mut parts = entry.split(':');
            let placement = segment(parts.next());
            let venue = segment(parts.next()).or_else(|| default_venue.clone())?;
            let device = segment(parts.next()).or_else(|| default_device.clone())?;
            let model = segment(parts.next()).unwrap_or_else(|| defaults.player_model.clone());

            Some(WarmTarget {
                placement_id: placement
                    .unwrap_or_else(|| format!("{}-{}", defaults.placement_id, index + 1)),
                venue_id: venue,
                device_id: device,
                player_model: model,
            })
        })
        .collect()
}
