//! # Entity Registries
//!
//! Two actors keep what the gateway knows about the devices around it:
//!
//! - [`bridges`] merges bridge status reports, resolves bridges against the backend and
//!   retries the ones that could not be resolved.
//! - [`beacons`] keeps per-pixel resolve results and the assets bound to them.
//!
//! Both talk to the backend through the resolver traits defined here. The backend itself
//! is outside this crate; [`OfflineResolver`] stands in when none is configured.

pub mod beacons;
pub mod bridges;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Owner reported by starter kit tags.
pub const STARTER_KIT_OWNER: &str = "devkit";

/// Names the backend uses for pixels it could not identify.
pub const UNRESOLVED_NAMES: [&str; 3] = ["N/A", "not-registered", "Unresolved"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    #[error("resolver backend unreachable: {0}")]
    Unreachable(String),
    #[error("resolver rejected request: {0}")]
    Rejected(String),
    #[error("resolver gave no answer within {0} ms")]
    Timeout(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyModuleConfig {
    pub energy_pattern: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapathModuleConfig {
    pub pacer_interval: Option<u64>,
}

/// One independently configured bridge module: what the bridge reports and what the
/// cloud wants it to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig<T> {
    pub config: Option<T>,
    pub desired_config: Option<T>,
}

impl<T: PartialEq> ModuleConfig<T> {
    pub fn pending(&self) -> bool {
        self.desired_config.is_some() && self.config != self.desired_config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeModules {
    #[serde(default)]
    pub energy2400: ModuleConfig<EnergyModuleConfig>,
    #[serde(default)]
    pub datapath: ModuleConfig<DatapathModuleConfig>,
}

/// A bridge as known to the backend, plus locally tracked presence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bridge {
    pub id: String,
    pub name: Option<String>,
    pub claimed: bool,
    pub owned: bool,
    pub fw_version: Option<String>,
    pub board_type: Option<u64>,
    /// Flat pacing rate, when the backend reports one.
    pub pacing_rate: Option<u64>,
    pub energizing_rate: Option<u64>,
    pub resolved: bool,
    pub processed_but_not_resolved: bool,
    pub flagged: bool,
    pub raw_reported_config: Option<serde_json::Value>,
    pub raw_desired_config: Option<serde_json::Value>,
    #[serde(default)]
    pub modules: BridgeModules,
    pub last_presence_timestamp: i64,
    pub last_rssi: Option<i32>,
    pub current_rssi: Option<i32>,
}

impl Bridge {
    /// Stand-in stored until the backend answers.
    pub fn placeholder(id: &str, rssi: Option<i32>) -> Self {
        Self {
            id: id.to_ascii_uppercase(),
            current_rssi: rssi,
            ..Self::default()
        }
    }

    pub fn pacing_rate(&self) -> Option<u64> {
        self.pacing_rate.or_else(|| {
            self.modules
                .datapath
                .config
                .as_ref()
                .and_then(|c| c.pacer_interval)
        })
    }

    pub fn energizing_rate(&self) -> Option<u64> {
        self.energizing_rate.or_else(|| {
            self.modules
                .energy2400
                .config
                .as_ref()
                .and_then(|c| c.energy_pattern)
        })
    }

    /// True when any desired configuration differs from the reported one.
    pub fn pending_update(&self) -> bool {
        let raw = self.raw_desired_config.is_some() && self.raw_desired_config != self.raw_reported_config;
        raw || self.modules.energy2400.pending() || self.modules.datapath.pending()
    }

    pub fn average_rssi(&self) -> Option<f64> {
        match (self.last_rssi, self.current_rssi) {
            (Some(a), Some(b)) => Some((a + b) as f64 / 2.0),
            (None, Some(v)) | (Some(v), None) => Some(v as f64),
            (None, None) => None,
        }
    }
}

/// Outcome of resolving one bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeLookup {
    Ok(Bridge),
    /// Known to the backend but not accessible to this owner.
    Unavailable(Bridge),
    /// Not known (yet); a partial record may come along.
    Unknown(Option<Bridge>),
    Error(ResolverError),
}

#[async_trait]
pub trait BridgeResolver: Send + Sync {
    async fn resolve(&self, bridge_id: &str, owner_id: &str) -> BridgeLookup;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTag {
    pub tag_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCategory {
    pub id: String,
    pub name: Option<String>,
    pub sku: Option<String>,
}

/// Postponement marker: while set and fresh, resolver results do not overwrite the asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postponed {
    pub flagged: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<AssetTag>,
    pub category: Option<AssetCategory>,
    pub category_id: Option<String>,
    #[serde(default)]
    pub postponed: Option<Postponed>,
}

impl Asset {
    pub fn has_tag(&self, tag_id: &str) -> bool {
        self.tags.iter().any(|t| t.tag_id == tag_id)
    }
}

/// What the backend knows about one pixel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveInfo {
    #[serde(rename = "deviceMAC")]
    pub device_mac: String,
    /// Resolved tag id, or one of [`UNRESOLVED_NAMES`].
    pub name: String,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub resolve_timestamp: i64,
    #[serde(default)]
    pub waiting_for_update: bool,
    pub asset: Option<Asset>,
}

impl ResolveInfo {
    pub fn is_starter_kit(&self) -> bool {
        self.owner_id.as_deref() == Some(STARTER_KIT_OWNER)
    }

    pub fn has_unresolved_name(&self) -> bool {
        UNRESOLVED_NAMES.contains(&self.name.as_str())
    }

    /// Nothing useful came back: no owner and no real name.
    pub fn is_unknown(&self) -> bool {
        let ownerless = self.owner_id.as_deref().map_or(true, |o| o.trim().is_empty());
        ownerless && (self.has_unresolved_name() || self.name.eq_ignore_ascii_case(&self.device_mac))
    }
}

/// Outcome of resolving one pixel.
#[derive(Debug, Clone, PartialEq)]
pub enum BeaconLookup {
    Resolved(ResolveInfo),
    Unresolved,
    Error(ResolverError),
}

#[async_trait]
pub trait BeaconResolver: Send + Sync {
    /// Resolve the pixel heard at `device_mac`, sending `payload` as it was received.
    async fn resolve(&self, device_mac: &str, payload: &str, owner_id: &str) -> BeaconLookup;

    /// Assets bound to a resolved pixel.
    async fn assets(&self, info: &ResolveInfo, owner_id: &str) -> Result<Vec<Asset>, ResolverError>;
}

/// Resolver used when no backend is configured: nothing ever resolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineResolver;

#[async_trait]
impl BridgeResolver for OfflineResolver {
    async fn resolve(&self, bridge_id: &str, _owner_id: &str) -> BridgeLookup {
        log::trace!("offline resolver: bridge {} stays unknown", bridge_id);
        BridgeLookup::Unknown(None)
    }
}

#[async_trait]
impl BeaconResolver for OfflineResolver {
    async fn resolve(&self, _device_mac: &str, _payload: &str, _owner_id: &str) -> BeaconLookup {
        BeaconLookup::Unresolved
    }

    async fn assets(&self, _info: &ResolveInfo, _owner_id: &str) -> Result<Vec<Asset>, ResolverError> {
        Ok(Vec::new())
    }
}
