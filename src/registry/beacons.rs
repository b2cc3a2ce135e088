//! Beacon registry actor.
//!
//! Keeps the pixels heard recently, what the backend said about each of them and the
//! assets bound to them. A pixel is sent to the resolver when it has no entry yet or its
//! entry was flagged for refresh. Resolved pixels with a real name trigger an asset
//! lookup; starter kit pixels put their asset in the claimable cache instead.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use super::{Asset, BeaconLookup, BeaconResolver, Postponed, ResolveInfo, ResolverError, UNRESOLVED_NAMES};
use crate::clock::now_millis;
use crate::config::TimingConfig;
use crate::metrics;
use crate::packet::Packet;

/// Resolve results this much older than the expiry limit are dropped on the next
/// observation.
const OUTDATED_GRACE_MS: i64 = 30_000;

#[derive(Debug, Clone)]
pub struct BeaconRegistryConfig {
    pub owner_id: String,
    pub postpone_ms: u64,
    pub expiry_ms: u64,
    /// Cool-down after a failed lookup before the pixel is asked for again.
    pub retry_ms: u64,
}

impl BeaconRegistryConfig {
    pub fn from_timing(owner_id: &str, timing: &TimingConfig) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            postpone_ms: timing.asset_postpone_ms(),
            expiry_ms: timing.beacon_expiry_ms(),
            retry_ms: timing.resolve_retry_ms(),
        }
    }
}

/// Which resolve entries to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    All,
    /// Every entry carrying this label.
    Label(String),
    /// Every entry bound to this asset id.
    Asset(String),
}

impl ClearScope {
    /// Scope implied by a resolve entry: its first label, else its asset.
    pub fn for_info(info: &ResolveInfo) -> Self {
        match info.labels.first() {
            Some(label) => ClearScope::Label(label.clone()),
            None => ClearScope::Asset(info.asset.as_ref().map(|a| a.id.clone()).unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SeenBeacon {
    packet: Packet,
    amount: u64,
}

/// One row of the signal level view: all pixels sharing a resolved name.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconView {
    pub name: String,
    pub owner_id: Option<String>,
    pub device_macs: Vec<String>,
    pub amount: u64,
    pub rssi: i32,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeaconSnapshot {
    /// Sorted by device MAC.
    pub resolve_info: Vec<ResolveInfo>,
    pub assets: Vec<Asset>,
    pub claimable: Vec<Asset>,
}

/// A resolver call the actor should make.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
    pub device_mac: String,
    pub payload: String,
    /// Entry that was flagged for refresh, if this is a refresh.
    pub waiting: Option<ResolveInfo>,
}

/// What to do after a resolver answer was stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupOutcome {
    pub changed: bool,
    pub ask_assets: Option<ResolveInfo>,
}

#[derive(Debug)]
pub struct BeaconState {
    seen: BTreeMap<String, SeenBeacon>,
    resolve_info: BTreeMap<String, ResolveInfo>,
    assets: BTreeMap<String, Asset>,
    claimable: BTreeMap<String, Asset>,
    in_flight: HashSet<String>,
    /// When the last lookup of a pixel failed.
    failed_at: HashMap<String, i64>,
    retry_ms: u64,
}

impl Default for BeaconState {
    fn default() -> Self {
        Self::with_retry(TimingConfig::default().resolve_retry_ms())
    }
}

fn tag_matches(asset: &Asset, info: &ResolveInfo) -> bool {
    asset
        .tags
        .iter()
        .any(|t| t.tag_id == info.name || info.labels.contains(&t.tag_id))
}

fn is_postponed(asset: &Asset, now: i64, postpone_ms: u64) -> bool {
    asset
        .postponed
        .is_some_and(|p| p.flagged && now - p.timestamp < postpone_ms as i64)
}

impl BeaconState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry_ms: u64) -> Self {
        Self {
            seen: BTreeMap::new(),
            resolve_info: BTreeMap::new(),
            assets: BTreeMap::new(),
            claimable: BTreeMap::new(),
            in_flight: HashSet::new(),
            failed_at: HashMap::new(),
            retry_ms,
        }
    }

    pub fn info(&self, device_mac: &str) -> Option<&ResolveInfo> {
        self.resolve_info.get(&device_mac.to_ascii_uppercase())
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Record a heard pixel. Returns a resolve request when the pixel has no entry or
    /// its entry waits for a refresh, no lookup for it is running and its last failed
    /// lookup is older than the retry cool-down.
    pub fn observe(&mut self, packet: &Packet, now: i64, expiry_ms: u64) -> Option<ResolveRequest> {
        let cutoff = now
            .saturating_sub(OUTDATED_GRACE_MS)
            .saturating_sub(i64::try_from(expiry_ms).unwrap_or(i64::MAX));
        self.remove_outdated(cutoff);
        self.seen.retain(|_, s| s.packet.timestamp > cutoff);
        self.failed_at.retain(|_, at| *at > cutoff);

        let mac = packet.device_mac();
        self.seen
            .entry(mac.clone())
            .and_modify(|s| {
                s.amount += 1;
                s.packet = packet.clone();
            })
            .or_insert_with(|| SeenBeacon {
                packet: packet.clone(),
                amount: 1,
            });

        if self.in_flight.contains(&mac) {
            return None;
        }
        let existing = self.resolve_info.get(&mac);
        let waiting = existing.filter(|i| i.waiting_for_update).cloned();
        if existing.is_some() && waiting.is_none() {
            return None;
        }
        if self
            .failed_at
            .get(&mac)
            .is_some_and(|at| now.saturating_sub(*at) <= i64::try_from(self.retry_ms).unwrap_or(i64::MAX))
        {
            return None;
        }
        self.in_flight.insert(mac.clone());
        Some(ResolveRequest {
            device_mac: mac,
            payload: packet.payload.clone(),
            waiting,
        })
    }

    /// Store a resolver answer for `device_mac`.
    pub fn apply_lookup(
        &mut self,
        device_mac: &str,
        waiting: Option<ResolveInfo>,
        lookup: BeaconLookup,
        now: i64,
    ) -> LookupOutcome {
        self.in_flight.remove(device_mac);
        let mut info = match lookup {
            BeaconLookup::Resolved(info) => info,
            BeaconLookup::Unresolved => ResolveInfo {
                name: UNRESOLVED_NAMES[2].to_string(),
                ..ResolveInfo::default()
            },
            BeaconLookup::Error(e) => {
                log::warn!("pixel {} resolve failed: {}", device_mac, e);
                self.failed_at.insert(device_mac.to_string(), now);
                return LookupOutcome::default();
            }
        };
        self.failed_at.remove(device_mac);
        info.device_mac = device_mac.to_string();
        info.waiting_for_update = false;
        if info.resolve_timestamp == 0 {
            info.resolve_timestamp = now;
        }
        self.resolve_info.insert(device_mac.to_string(), info.clone());

        let mut out = LookupOutcome {
            changed: true,
            ask_assets: None,
        };
        if let Some(previous) = waiting {
            if info.owner_id.is_some() && info.owner_id == previous.owner_id {
                return out;
            }
            // owner changed: whatever we had for this pixel is stale
            self.clear_assets(Some(&info));
            return out;
        }
        if info.is_starter_kit() {
            if let Some(asset) = info.asset.clone() {
                self.add_claimable(asset);
            }
        } else if !info.has_unresolved_name() {
            out.ask_assets = Some(info);
        }
        out
    }

    /// Merge an asset lookup answer. Assets flagged for update less than `postpone_ms`
    /// ago keep their local copy.
    pub fn apply_assets(&mut self, assets: Vec<Asset>, now: i64, postpone_ms: u64) -> bool {
        let mut changed = false;
        for asset in assets {
            let shielded = self
                .assets
                .get(&asset.id)
                .is_some_and(|stored| is_postponed(stored, now, postpone_ms));
            if shielded {
                log::debug!("asset {} postponed, keeping local copy", asset.id);
                continue;
            }
            self.assets.insert(asset.id.clone(), asset);
            changed = true;
        }
        changed
    }

    pub fn add_claimable(&mut self, asset: Asset) -> bool {
        if self.claimable.contains_key(&asset.id) {
            return false;
        }
        self.claimable.insert(asset.id.clone(), asset);
        true
    }

    pub fn clear(&mut self, scope: &ClearScope) -> usize {
        let before = self.resolve_info.len();
        match scope {
            ClearScope::All => self.resolve_info.clear(),
            ClearScope::Label(label) => self.resolve_info.retain(|_, i| !i.labels.contains(label)),
            ClearScope::Asset(id) => self
                .resolve_info
                .retain(|_, i| i.asset.as_ref().map(|a| &a.id) != Some(id)),
        }
        before - self.resolve_info.len()
    }

    /// Set or reset the refresh flag on one entry, or on every entry.
    pub fn flag(&mut self, device_mac: Option<&str>, should_update: bool) {
        match device_mac {
            None => self
                .resolve_info
                .values_mut()
                .for_each(|i| i.waiting_for_update = should_update),
            Some(mac) => {
                if let Some(info) = self.resolve_info.get_mut(&mac.to_ascii_uppercase()) {
                    info.waiting_for_update = should_update;
                }
            }
        }
    }

    /// Drop entries resolved at or before `outdated`.
    pub fn remove_outdated(&mut self, outdated: i64) -> usize {
        let before = self.resolve_info.len();
        self.resolve_info.retain(|_, i| i.resolve_timestamp > outdated);
        before - self.resolve_info.len()
    }

    /// Drop assets bound to `info` (by tag id or label), or all of them.
    pub fn clear_assets(&mut self, info: Option<&ResolveInfo>) {
        match info {
            None => self.assets.clear(),
            Some(info) => self.assets.retain(|_, a| !tag_matches(a, info)),
        }
    }

    /// Mark assets as postponed so resolver answers do not overwrite them for a while.
    pub fn flag_assets(&mut self, info: Option<&ResolveInfo>, now: i64) {
        let marker = Some(Postponed {
            flagged: true,
            timestamp: now,
        });
        for asset in self.assets.values_mut() {
            if info.map_or(true, |i| tag_matches(asset, i)) {
                asset.postponed = marker;
            }
        }
    }

    /// Heard pixels grouped by resolved name. Pro mode keeps everything that is not
    /// unknown; otherwise only own and starter kit pixels are shown.
    pub fn signal_level(&self, pro: bool, owner_id: &str) -> Vec<BeaconView> {
        let mut grouped: BTreeMap<String, BeaconView> = BTreeMap::new();
        for (mac, seen) in &self.seen {
            let info = self.resolve_info.get(mac);
            let keep = match info {
                None => false,
                Some(i) if pro => !i.is_unknown(),
                Some(i) => i.is_starter_kit() || i.owner_id.as_deref() == Some(owner_id),
            };
            let Some(info) = info.filter(|_| keep) else {
                continue;
            };
            let view = grouped.entry(info.name.clone()).or_insert_with(|| BeaconView {
                name: info.name.clone(),
                owner_id: info.owner_id.clone(),
                device_macs: Vec::new(),
                amount: 0,
                rssi: seen.packet.rssi,
                last_seen: seen.packet.timestamp,
            });
            view.device_macs.push(mac.clone());
            view.amount += seen.amount;
            if seen.packet.timestamp >= view.last_seen {
                view.last_seen = seen.packet.timestamp;
                view.rssi = seen.packet.rssi;
            }
        }
        grouped.into_values().collect()
    }

    pub fn snapshot(&self) -> BeaconSnapshot {
        BeaconSnapshot {
            resolve_info: self.resolve_info.values().cloned().collect(),
            assets: self.assets.values().cloned().collect(),
            claimable: self.claimable.values().cloned().collect(),
        }
    }
}

pub enum BeaconCommand {
    /// Pixel packets heard through the pipeline.
    Observe(Vec<Packet>),
    Resolved {
        device_mac: String,
        waiting: Option<ResolveInfo>,
        lookup: BeaconLookup,
    },
    AssetsLoaded(Result<Vec<Asset>, ResolverError>),
    Clear(ClearScope),
    Flag { device_mac: Option<String>, should_update: bool },
    RemoveOutdated(i64),
    ClearAssets(Option<ResolveInfo>),
    FlagAssets(Option<ResolveInfo>),
    AddClaimable(Asset),
    SignalLevel { pro: bool, resp: oneshot::Sender<Vec<BeaconView>> },
    Snapshot(oneshot::Sender<BeaconSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct BeaconRegistryHandle {
    tx: mpsc::UnboundedSender<BeaconCommand>,
    snapshots: watch::Receiver<BeaconSnapshot>,
}

impl BeaconRegistryHandle {
    pub fn observe(&self, packets: Vec<Packet>) {
        let _ = self.tx.send(BeaconCommand::Observe(packets));
    }

    pub fn clear(&self, scope: ClearScope) {
        let _ = self.tx.send(BeaconCommand::Clear(scope));
    }

    /// Flag one pixel (or all with `None`) so it is resolved again next time it is heard.
    pub fn flag(&self, device_mac: Option<&str>, should_update: bool) {
        let _ = self.tx.send(BeaconCommand::Flag {
            device_mac: device_mac.map(str::to_string),
            should_update,
        });
    }

    pub fn remove_outdated(&self, outdated: i64) {
        let _ = self.tx.send(BeaconCommand::RemoveOutdated(outdated));
    }

    pub fn clear_assets(&self, info: Option<ResolveInfo>) {
        let _ = self.tx.send(BeaconCommand::ClearAssets(info));
    }

    pub fn flag_assets(&self, info: Option<ResolveInfo>) {
        let _ = self.tx.send(BeaconCommand::FlagAssets(info));
    }

    pub fn add_claimable(&self, asset: Asset) {
        let _ = self.tx.send(BeaconCommand::AddClaimable(asset));
    }

    pub fn watch(&self) -> watch::Receiver<BeaconSnapshot> {
        self.snapshots.clone()
    }

    pub async fn signal_level(&self, pro: bool) -> Option<Vec<BeaconView>> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(BeaconCommand::SignalLevel { pro, resp }).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn snapshot(&self) -> Option<BeaconSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(BeaconCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BeaconCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

pub fn start_beacon_registry(cfg: BeaconRegistryConfig, resolver: Arc<dyn BeaconResolver>) -> BeaconRegistryHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<BeaconCommand>();
    let (snap_tx, snap_rx) = watch::channel(BeaconSnapshot::default());
    let mailbox = tx.downgrade();
    let handle = BeaconRegistryHandle { tx, snapshots: snap_rx };

    tokio::spawn(async move {
        let mut state = BeaconState::with_retry(cfg.retry_ms);
        while let Some(cmd) = rx.recv().await {
            let now = now_millis();
            let changed = match cmd {
                BeaconCommand::Observe(packets) => {
                    for packet in &packets {
                        let Some(req) = state.observe(packet, now, cfg.expiry_ms) else {
                            continue;
                        };
                        metrics::inc_resolver_calls();
                        let resolver = Arc::clone(&resolver);
                        let mailbox = mailbox.clone();
                        let owner = cfg.owner_id.clone();
                        let limit = cfg.retry_ms;
                        tokio::spawn(async move {
                            let lookup = tokio::time::timeout(
                                Duration::from_millis(limit),
                                resolver.resolve(&req.device_mac, &req.payload, &owner),
                            )
                            .await
                            .unwrap_or(BeaconLookup::Error(ResolverError::Timeout(limit)));
                            if let Some(tx) = mailbox.upgrade() {
                                let _ = tx.send(BeaconCommand::Resolved {
                                    device_mac: req.device_mac,
                                    waiting: req.waiting,
                                    lookup,
                                });
                            }
                        });
                    }
                    false
                }
                BeaconCommand::Resolved { device_mac, waiting, lookup } => {
                    let out = state.apply_lookup(&device_mac, waiting, lookup, now);
                    if let Some(info) = out.ask_assets {
                        let resolver = Arc::clone(&resolver);
                        let mailbox = mailbox.clone();
                        let owner = cfg.owner_id.clone();
                        tokio::spawn(async move {
                            let result = resolver.assets(&info, &owner).await;
                            if let Some(tx) = mailbox.upgrade() {
                                let _ = tx.send(BeaconCommand::AssetsLoaded(result));
                            }
                        });
                    }
                    out.changed
                }
                BeaconCommand::AssetsLoaded(result) => match result {
                    Ok(assets) => state.apply_assets(assets, now, cfg.postpone_ms),
                    Err(e) => {
                        log::warn!("asset lookup failed: {}", e);
                        false
                    }
                },
                BeaconCommand::Clear(scope) => {
                    let removed = state.clear(&scope);
                    log::debug!("cleared {} resolve entries ({:?})", removed, scope);
                    true
                }
                BeaconCommand::Flag { device_mac, should_update } => {
                    state.flag(device_mac.as_deref(), should_update);
                    true
                }
                BeaconCommand::RemoveOutdated(outdated) => state.remove_outdated(outdated) > 0,
                BeaconCommand::ClearAssets(info) => {
                    state.clear_assets(info.as_ref());
                    true
                }
                BeaconCommand::FlagAssets(info) => {
                    state.flag_assets(info.as_ref(), now);
                    true
                }
                BeaconCommand::AddClaimable(asset) => state.add_claimable(asset),
                BeaconCommand::SignalLevel { pro, resp } => {
                    let _ = resp.send(state.signal_level(pro, &cfg.owner_id));
                    false
                }
                BeaconCommand::Snapshot(resp) => {
                    let _ = resp.send(state.snapshot());
                    false
                }
                BeaconCommand::Shutdown(done) => {
                    let _ = done.send(());
                    break;
                }
            };
            if changed {
                let _ = snap_tx.send(state.snapshot());
            }
        }
        log::debug!("beacon registry loop terminated");
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{classify, ScanEvent};
    use crate::registry::{AssetTag, STARTER_KIT_OWNER};

    const DIRECT: &str = "AFFD0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9";

    fn pixel(mac: &str, ts: i64) -> Packet {
        classify(&ScanEvent::new(DIRECT, mac, -50, ts)).unwrap()
    }

    fn info(name: &str, owner: Option<&str>) -> ResolveInfo {
        ResolveInfo {
            name: name.into(),
            owner_id: owner.map(str::to_string),
            ..ResolveInfo::default()
        }
    }

    fn asset(id: &str, tag: &str) -> Asset {
        Asset {
            id: id.into(),
            tags: vec![AssetTag { tag_id: tag.into() }],
            ..Asset::default()
        }
    }

    #[test]
    fn resolves_once_until_flagged() {
        let mut s = BeaconState::new();
        let req = s.observe(&pixel("AA:00:00:00:00:01", 1_000), 1_000, 60_000).expect("first");
        assert!(s.observe(&pixel("AA:00:00:00:00:01", 1_100), 1_100, 60_000).is_none(), "in flight");
        s.apply_lookup(&req.device_mac, None, BeaconLookup::Resolved(info("T1", Some("acme"))), 1_200);
        assert!(s.observe(&pixel("AA:00:00:00:00:01", 1_300), 1_300, 60_000).is_none());

        s.flag(Some("aa:00:00:00:00:01"), true);
        let refresh = s.observe(&pixel("AA:00:00:00:00:01", 1_400), 1_400, 60_000).expect("refresh");
        assert!(refresh.waiting.is_some());
    }

    #[test]
    fn failed_lookup_waits_for_cool_down() {
        let mut s = BeaconState::with_retry(30_000);
        let req = s.observe(&pixel("AA:00:00:00:00:05", 1_000), 1_000, 600_000).expect("first");
        let out = s.apply_lookup(&req.device_mac, None, BeaconLookup::Error(ResolverError::Unreachable("timeout".into())), 1_050);
        assert!(!out.changed);
        assert!(s.info("AA:00:00:00:00:05").is_none());

        assert!(s.observe(&pixel("AA:00:00:00:00:05", 1_150), 1_150, 600_000).is_none());
        assert!(s.observe(&pixel("AA:00:00:00:00:05", 31_050), 31_050, 600_000).is_none());
        let again = s.observe(&pixel("AA:00:00:00:00:05", 31_051), 31_051, 600_000).expect("after cool-down");
        s.apply_lookup(&again.device_mac, None, BeaconLookup::Unresolved, 31_100);
        assert!(s.info("AA:00:00:00:00:05").is_some());
    }

    #[test]
    fn owner_change_drops_assets() {
        let mut s = BeaconState::new();
        s.apply_assets(vec![asset("A1", "T1")], 0, 5_000);
        let mut old = info("T1", Some("acme"));
        old.waiting_for_update = true;
        let out = s.apply_lookup("AA", Some(old.clone()), BeaconLookup::Resolved(info("T1", Some("other"))), 10);
        assert!(out.ask_assets.is_none());
        assert!(s.snapshot().assets.is_empty());

        s.apply_assets(vec![asset("A1", "T1")], 0, 5_000);
        s.apply_lookup("AA", Some(old), BeaconLookup::Resolved(info("T1", Some("acme"))), 20);
        assert_eq!(s.snapshot().assets.len(), 1);
        assert!(!s.info("AA").unwrap().waiting_for_update);
    }

    #[test]
    fn starter_kit_goes_to_claimable_and_sentinels_skip_assets() {
        let mut s = BeaconState::new();
        let mut kit = info("T9", Some(STARTER_KIT_OWNER));
        kit.asset = Some(asset("K1", "T9"));
        let out = s.apply_lookup("BB", None, BeaconLookup::Resolved(kit), 0);
        assert!(out.ask_assets.is_none());
        assert_eq!(s.snapshot().claimable[0].id, "K1");

        let out = s.apply_lookup("CC", None, BeaconLookup::Resolved(info("not-registered", None)), 0);
        assert!(out.ask_assets.is_none());
        let out = s.apply_lookup("DD", None, BeaconLookup::Resolved(info("T2", Some("acme"))), 0);
        assert_eq!(out.ask_assets.map(|i| i.name), Some("T2".to_string()));
    }

    #[test]
    fn postponed_asset_shielded_for_window() {
        let mut s = BeaconState::new();
        s.apply_assets(vec![asset("A1", "T1")], 0, 5_000);
        s.flag_assets(None, 1_000);
        let mut renamed = asset("A1", "T1");
        renamed.name = Some("new".into());
        assert!(!s.apply_assets(vec![renamed.clone()], 5_999, 5_000));
        assert!(s.apply_assets(vec![renamed], 6_000, 5_000));
        assert_eq!(s.snapshot().assets[0].name.as_deref(), Some("new"));
    }

    #[test]
    fn clear_by_label_and_asset() {
        let mut s = BeaconState::new();
        let mut a = info("T1", Some("acme"));
        a.labels = vec!["dock".into()];
        let mut b = info("T2", Some("acme"));
        b.asset = Some(asset("A2", "T2"));
        s.apply_lookup("01", None, BeaconLookup::Resolved(a.clone()), 0);
        s.apply_lookup("02", None, BeaconLookup::Resolved(b.clone()), 0);
        s.apply_lookup("03", None, BeaconLookup::Resolved(b.clone()), 0);

        assert_eq!(s.clear(&ClearScope::for_info(&a)), 1);
        assert_eq!(s.clear(&ClearScope::for_info(&b)), 2);
        assert!(s.snapshot().resolve_info.is_empty());
    }

    #[test]
    fn signal_level_modes() {
        let mut s = BeaconState::new();
        for (mac, ts) in [("AA:00:00:00:00:01", 10), ("AA:00:00:00:00:02", 20), ("AA:00:00:00:00:03", 30)] {
            s.observe(&pixel(mac, ts), ts, 60_000);
        }
        s.apply_lookup("AA:00:00:00:00:01", None, BeaconLookup::Resolved(info("MINE", Some("acme"))), 40);
        s.apply_lookup("AA:00:00:00:00:02", None, BeaconLookup::Resolved(info("THEIRS", Some("other"))), 40);
        s.apply_lookup("AA:00:00:00:00:03", None, BeaconLookup::Unresolved, 40);

        let normal: Vec<String> = s.signal_level(false, "acme").into_iter().map(|v| v.name).collect();
        assert_eq!(normal, vec!["MINE".to_string()]);
        let pro: Vec<String> = s.signal_level(true, "acme").into_iter().map(|v| v.name).collect();
        assert_eq!(pro, vec!["MINE".to_string(), "THEIRS".to_string()]);
    }
}
