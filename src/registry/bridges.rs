//! Bridge registry actor.
//!
//! Status reports from the pipeline are merged per bridge id. A bridge seen for the
//! first time is stored as a placeholder and handed to the [`BridgeResolver`]; while it
//! stays unresolved a sync tick asks again once the retry cool-down has passed. Entries
//! nobody has touched for the prune window are dropped and reported with
//! [`CLEARED_TIMESTAMP`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use super::{Bridge, BridgeLookup, BridgeResolver, ResolverError};
use crate::clock::now_millis;
use crate::config::TimingConfig;
use crate::metrics;
use crate::packet::bridge_status::{BridgeStatus, CLEARED_TIMESTAMP};
use crate::packet::Packet;

#[derive(Debug, Clone)]
pub struct BridgeRegistryConfig {
    pub owner_id: String,
    pub sync_ms: u64,
    pub retry_ms: u64,
    pub prune_ms: u64,
}

impl BridgeRegistryConfig {
    pub fn from_timing(owner_id: &str, timing: &TimingConfig) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            sync_ms: timing.bridge_sync_ms(),
            retry_ms: timing.resolve_retry_ms(),
            prune_ms: timing.bridge_prune_ms(),
        }
    }
}

/// What the registry reports to the rest of the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// New bridges and meaningful updates.
    Changed(Vec<BridgeStatus>),
    /// Pruned entries, timestamp set to [`CLEARED_TIMESTAMP`].
    Cleared(Vec<BridgeStatus>),
}

/// Read-only view published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeSnapshot {
    /// Strongest first.
    pub bridges: Vec<Bridge>,
    /// Sorted by id.
    pub statuses: Vec<BridgeStatus>,
    pub unresolved: Vec<String>,
}

#[derive(Debug, Default)]
pub struct BridgeState {
    statuses: HashMap<String, BridgeStatus>,
    bridges: HashMap<String, Bridge>,
    unresolved: HashSet<String>,
    last_attempt: HashMap<String, i64>,
    in_flight: HashSet<String>,
}

/// Result of merging a batch of statuses.
#[derive(Debug, Default, PartialEq)]
pub struct MergeOutcome {
    pub changed: Vec<BridgeStatus>,
    /// Ids that should be resolved now.
    pub to_resolve: Vec<String>,
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn status(&self, id: &str) -> Option<&BridgeStatus> {
        self.statuses.get(&id.to_ascii_uppercase())
    }

    pub fn bridge(&self, id: &str) -> Option<&Bridge> {
        self.bridges.get(&id.to_ascii_uppercase())
    }

    pub fn is_unresolved(&self, id: &str) -> bool {
        self.unresolved.contains(&id.to_ascii_uppercase())
    }

    /// Mark `id` as being resolved. False when a lookup is already running.
    pub fn begin_resolve(&mut self, id: &str, now: i64) -> bool {
        if !self.in_flight.insert(id.to_string()) {
            return false;
        }
        self.last_attempt.insert(id.to_string(), now);
        true
    }

    pub fn add_statuses(&mut self, statuses: Vec<BridgeStatus>, now: i64) -> MergeOutcome {
        let mut out = MergeOutcome::default();
        for mut status in statuses {
            status.id = status.id.to_ascii_uppercase();
            let id = status.id.clone();
            match self.statuses.get_mut(&id) {
                Some(existing) => {
                    if existing.merge(&status) {
                        out.changed.push(existing.clone());
                    }
                }
                None => {
                    let rssi = status.packet.as_ref().map(|p| p.rssi);
                    let mut placeholder = Bridge::placeholder(&id, rssi);
                    placeholder.fw_version = status.version.clone();
                    placeholder.board_type = status.board_type;
                    placeholder.last_presence_timestamp = status.timestamp;
                    self.bridges.insert(id.clone(), placeholder);
                    self.unresolved.insert(id.clone());
                    out.changed.push(status.clone());
                    self.statuses.insert(id.clone(), status);
                    if self.begin_resolve(&id, now) {
                        out.to_resolve.push(id);
                    }
                }
            }
        }
        out
    }

    /// Register bridges first seen through their connectable advertisement. Known ones
    /// only get a presence update.
    pub fn add_early(&mut self, packets: &[Packet], now: i64) -> MergeOutcome {
        let mut fresh = Vec::new();
        for packet in packets {
            let Some(status) = BridgeStatus::from_packet(packet) else {
                continue;
            };
            if self.statuses.contains_key(&status.id) {
                self.presence(&status.id, packet.rssi, packet.timestamp);
            } else {
                fresh.push(status);
            }
        }
        self.add_statuses(fresh, now)
    }

    /// Store a resolver answer. Returns true when the bridge is now resolved.
    pub fn apply_lookup(&mut self, id: &str, lookup: BridgeLookup, now: i64) -> bool {
        self.in_flight.remove(id);
        if !self.statuses.contains_key(id) {
            // pruned or cleared while the lookup ran
            return false;
        }
        let previous = self.bridges.get(id).cloned().unwrap_or_else(|| Bridge::placeholder(id, None));
        let carry = |mut bridge: Bridge| {
            bridge.id = id.to_string();
            bridge.current_rssi = previous.current_rssi;
            bridge.last_rssi = previous.last_rssi;
            bridge.last_presence_timestamp = previous.last_presence_timestamp;
            if bridge.fw_version.is_none() {
                bridge.fw_version = previous.fw_version.clone();
            }
            bridge
        };
        match lookup {
            BridgeLookup::Ok(bridge) | BridgeLookup::Unavailable(bridge) => {
                let mut bridge = carry(bridge);
                bridge.resolved = true;
                bridge.processed_but_not_resolved = false;
                bridge.flagged = false;
                self.bridges.insert(id.to_string(), bridge);
                self.unresolved.remove(id);
                true
            }
            BridgeLookup::Unknown(partial) => {
                if let Some(partial) = partial {
                    let mut bridge = carry(partial);
                    bridge.resolved = false;
                    bridge.processed_but_not_resolved = true;
                    self.bridges.insert(id.to_string(), bridge);
                }
                self.unresolved.insert(id.to_string());
                self.last_attempt.insert(id.to_string(), now);
                false
            }
            BridgeLookup::Error(e) => {
                log::warn!("bridge {} resolve failed: {}", id, e);
                self.unresolved.insert(id.to_string());
                self.last_attempt.insert(id.to_string(), now);
                false
            }
        }
    }

    /// Unresolved ids whose last attempt is older than `retry_ms`.
    pub fn due_for_retry(&self, now: i64, retry_ms: u64) -> Vec<String> {
        let mut due: Vec<String> = self
            .unresolved
            .iter()
            .filter(|id| !self.in_flight.contains(*id))
            .filter(|id| {
                self.last_attempt
                    .get(*id)
                    .map_or(true, |at| now - at > retry_ms as i64)
            })
            .cloned()
            .collect();
        due.sort();
        due
    }

    /// Presence report for a known bridge. Unknown ids are ignored.
    pub fn presence(&mut self, id: &str, rssi: i32, timestamp: i64) -> bool {
        let id = id.to_ascii_uppercase();
        let Some(bridge) = self.bridges.get_mut(&id) else {
            return false;
        };
        bridge.last_rssi = bridge.current_rssi;
        bridge.current_rssi = Some(rssi);
        bridge.last_presence_timestamp = bridge.last_presence_timestamp.max(timestamp);
        if let Some(status) = self.statuses.get_mut(&id) {
            status.timestamp = status.timestamp.max(timestamp);
        }
        true
    }

    /// Force a fresh resolve of `id`, registering it with a synthetic status if needed.
    pub fn flag(&mut self, id: &str, now: i64) -> MergeOutcome {
        let id = id.to_ascii_uppercase();
        if !self.statuses.contains_key(&id) {
            let mut out = self.add_statuses(vec![BridgeStatus::synthetic(&id, now)], now);
            if let Some(bridge) = self.bridges.get_mut(&id) {
                bridge.flagged = true;
            }
            out.changed.clear();
            return out;
        }
        if let Some(bridge) = self.bridges.get_mut(&id) {
            bridge.flagged = true;
        }
        self.unresolved.insert(id.clone());
        let mut out = MergeOutcome::default();
        if self.begin_resolve(&id, now) {
            out.to_resolve.push(id);
        }
        out
    }

    pub fn set_firmware_version(&mut self, id: &str, version: &str) -> bool {
        let id = id.to_ascii_uppercase();
        match self.bridges.get_mut(&id) {
            Some(bridge) => {
                bridge.fw_version = Some(version.to_string());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.bridges.clear();
        self.unresolved.clear();
        self.last_attempt.clear();
        self.in_flight.clear();
    }

    /// Drop entries whose status is at least `prune_ms` old.
    pub fn prune(&mut self, now: i64, prune_ms: u64) -> Vec<BridgeStatus> {
        let cutoff = now.saturating_sub(i64::try_from(prune_ms).unwrap_or(i64::MAX));
        let mut stale: Vec<String> = self
            .statuses
            .values()
            .filter(|s| s.timestamp <= cutoff)
            .map(|s| s.id.clone())
            .collect();
        stale.sort();
        let mut cleared = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(mut status) = self.statuses.remove(&id) {
                status.timestamp = CLEARED_TIMESTAMP;
                cleared.push(status);
            }
            self.bridges.remove(&id);
            self.unresolved.remove(&id);
            self.last_attempt.remove(&id);
            self.in_flight.remove(&id);
        }
        cleared
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        let mut bridges: Vec<Bridge> = self.bridges.values().cloned().collect();
        bridges.sort_by(|a, b| {
            let ra = a.average_rssi().unwrap_or(f64::MIN);
            let rb = b.average_rssi().unwrap_or(f64::MIN);
            rb.total_cmp(&ra).then_with(|| a.id.cmp(&b.id))
        });
        let mut statuses: Vec<BridgeStatus> = self.statuses.values().cloned().collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        let mut unresolved: Vec<String> = self.unresolved.iter().cloned().collect();
        unresolved.sort();
        BridgeSnapshot {
            bridges,
            statuses,
            unresolved,
        }
    }
}

pub enum BridgeCommand {
    AddStatuses(Vec<BridgeStatus>),
    Early(Vec<Packet>),
    /// Heartbeats used as presence reports.
    Presence(Vec<Packet>),
    Resolved { id: String, lookup: BridgeLookup },
    Flag(String),
    SetFirmwareVersion { id: String, version: String },
    Clear,
    Snapshot(oneshot::Sender<BridgeSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct BridgeRegistryHandle {
    tx: mpsc::UnboundedSender<BridgeCommand>,
    snapshots: watch::Receiver<BridgeSnapshot>,
}

impl BridgeRegistryHandle {
    pub fn add_statuses(&self, statuses: Vec<BridgeStatus>) {
        let _ = self.tx.send(BridgeCommand::AddStatuses(statuses));
    }

    pub fn add_early(&self, packets: Vec<Packet>) {
        let _ = self.tx.send(BridgeCommand::Early(packets));
    }

    pub fn presence(&self, heartbeats: Vec<Packet>) {
        let _ = self.tx.send(BridgeCommand::Presence(heartbeats));
    }

    pub fn flag(&self, id: &str) {
        let _ = self.tx.send(BridgeCommand::Flag(id.to_string()));
    }

    pub fn set_firmware_version(&self, id: &str, version: &str) {
        let _ = self.tx.send(BridgeCommand::SetFirmwareVersion {
            id: id.to_string(),
            version: version.to_string(),
        });
    }

    pub fn clear(&self) {
        let _ = self.tx.send(BridgeCommand::Clear);
    }

    /// Live view, updated after every change.
    pub fn watch(&self) -> watch::Receiver<BridgeSnapshot> {
        self.snapshots.clone()
    }

    pub async fn snapshot(&self) -> Option<BridgeSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(BridgeCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BridgeCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

fn spawn_resolve(
    ids: Vec<String>,
    cfg: &BridgeRegistryConfig,
    resolver: &Arc<dyn BridgeResolver>,
    mailbox: &mpsc::WeakUnboundedSender<BridgeCommand>,
) {
    for id in ids {
        metrics::inc_resolver_calls();
        let resolver = Arc::clone(resolver);
        let mailbox = mailbox.clone();
        let owner = cfg.owner_id.clone();
        let limit = cfg.retry_ms;
        tokio::spawn(async move {
            // a lookup that never returns would keep the id in flight for good
            let lookup = tokio::time::timeout(Duration::from_millis(limit), resolver.resolve(&id, &owner))
                .await
                .unwrap_or(BridgeLookup::Error(ResolverError::Timeout(limit)));
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(BridgeCommand::Resolved { id, lookup });
            }
        });
    }
}

pub fn start_bridge_registry(
    cfg: BridgeRegistryConfig,
    resolver: Arc<dyn BridgeResolver>,
    outgoing: mpsc::UnboundedSender<BridgeEvent>,
) -> BridgeRegistryHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<BridgeCommand>();
    let (snap_tx, snap_rx) = watch::channel(BridgeSnapshot::default());
    let mailbox = tx.downgrade();
    let handle = BridgeRegistryHandle { tx, snapshots: snap_rx };

    tokio::spawn(async move {
        let mut state = BridgeState::new();
        let mut sync = tokio::time::interval(Duration::from_millis(cfg.sync_ms.max(1)));
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let mut changed = true;
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let now = now_millis();
                    match cmd {
                        BridgeCommand::AddStatuses(statuses) => {
                            let out = state.add_statuses(statuses, now);
                            spawn_resolve(out.to_resolve, &cfg, &resolver, &mailbox);
                            changed = !out.changed.is_empty();
                            if changed {
                                let _ = outgoing.send(BridgeEvent::Changed(out.changed));
                            }
                        }
                        BridgeCommand::Early(packets) => {
                            let out = state.add_early(&packets, now);
                            spawn_resolve(out.to_resolve, &cfg, &resolver, &mailbox);
                            if !out.changed.is_empty() {
                                let _ = outgoing.send(BridgeEvent::Changed(out.changed));
                            }
                        }
                        BridgeCommand::Presence(packets) => {
                            for p in &packets {
                                if let Some(id) = p.bridge_id() {
                                    state.presence(&id, p.rssi, p.timestamp);
                                }
                            }
                        }
                        BridgeCommand::Resolved { id, lookup } => {
                            if state.apply_lookup(&id, lookup, now) {
                                log::debug!("bridge {} resolved", id);
                            }
                        }
                        BridgeCommand::Flag(id) => {
                            log::info!("bridge {} flagged for update", id);
                            let out = state.flag(&id, now);
                            spawn_resolve(out.to_resolve, &cfg, &resolver, &mailbox);
                        }
                        BridgeCommand::SetFirmwareVersion { id, version } => {
                            changed = state.set_firmware_version(&id, &version);
                        }
                        BridgeCommand::Clear => state.clear(),
                        BridgeCommand::Snapshot(resp) => {
                            let _ = resp.send(state.snapshot());
                            changed = false;
                        }
                        BridgeCommand::Shutdown(done) => {
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                _ = sync.tick() => {
                    let now = now_millis();
                    let due = state.due_for_retry(now, cfg.retry_ms);
                    let due: Vec<String> = due.into_iter().filter(|id| state.begin_resolve(id, now)).collect();
                    if !due.is_empty() {
                        log::debug!("retrying {} unresolved bridge(s)", due.len());
                    }
                    spawn_resolve(due, &cfg, &resolver, &mailbox);
                    let cleared = state.prune(now, cfg.prune_ms);
                    changed = !cleared.is_empty();
                    if changed {
                        log::info!("pruned {} stale bridge(s)", cleared.len());
                        let _ = outgoing.send(BridgeEvent::Cleared(cleared));
                    }
                }
            }
            if changed {
                let _ = snap_tx.send(state.snapshot());
            }
        }
        log::debug!("bridge registry loop terminated");
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::bridge_status::Formation;
    use crate::registry::ResolverError;

    fn status(id: &str, ts: i64) -> BridgeStatus {
        BridgeStatus {
            formation: Formation::FromHb,
            ..BridgeStatus::synthetic(id, ts)
        }
    }

    #[test]
    fn unseen_id_is_placeholder_and_resolved_once() {
        let mut s = BridgeState::new();
        let out = s.add_statuses(vec![status("aabbccddeeff", 100)], 100);
        assert_eq!(out.to_resolve, vec!["AABBCCDDEEFF".to_string()]);
        assert!(s.is_unresolved("AABBCCDDEEFF"));
        let again = s.add_statuses(vec![status("AABBCCDDEEFF", 200)], 200);
        assert!(again.to_resolve.is_empty());
        assert!(again.changed.is_empty());
        assert_eq!(s.status("AABBCCDDEEFF").map(|st| st.timestamp), Some(200));
    }

    #[test]
    fn retry_waits_for_cool_down() {
        let mut s = BridgeState::new();
        s.add_statuses(vec![status("AABBCCDDEEFF", 0)], 0);
        assert!(s.due_for_retry(60_000, 30_000).is_empty(), "in flight");
        s.apply_lookup("AABBCCDDEEFF", BridgeLookup::Error(ResolverError::Unreachable("x".into())), 1_000);
        assert!(s.due_for_retry(31_000, 30_000).is_empty());
        assert_eq!(s.due_for_retry(31_001, 30_000), vec!["AABBCCDDEEFF".to_string()]);
    }

    #[test]
    fn resolved_bridge_keeps_current_rssi() {
        let mut s = BridgeState::new();
        s.add_statuses(vec![status("AABBCCDDEEFF", 0)], 0);
        s.presence("AABBCCDDEEFF", -70, 10);
        s.presence("AABBCCDDEEFF", -60, 20);
        let backend = Bridge {
            id: "AABBCCDDEEFF".into(),
            name: Some("dock".into()),
            ..Bridge::default()
        };
        assert!(s.apply_lookup("AABBCCDDEEFF", BridgeLookup::Ok(backend), 30));
        let b = s.bridge("AABBCCDDEEFF").unwrap();
        assert_eq!((b.last_rssi, b.current_rssi), (Some(-70), Some(-60)));
        assert!(b.resolved);
        assert!(!s.is_unresolved("AABBCCDDEEFF"));
    }

    #[test]
    fn prune_reports_cleared_sentinel() {
        let mut s = BridgeState::new();
        s.add_statuses(vec![status("AABBCCDDEEFF", 0), status("112233445566", 500_000)], 0);
        let cleared = s.prune(600_000, 600_000);
        assert_eq!(cleared.len(), 1);
        assert!(cleared[0].is_cleared());
        assert!(s.bridge("AABBCCDDEEFF").is_none());
        assert!(s.status("112233445566").is_some());
    }

    #[test]
    fn snapshot_sorted_by_signal() {
        let mut s = BridgeState::new();
        s.add_statuses(vec![status("000000000001", 0), status("000000000002", 0)], 0);
        s.presence("000000000001", -80, 1);
        s.presence("000000000002", -40, 1);
        let snap = s.snapshot();
        assert_eq!(snap.bridges[0].id, "000000000002");
        assert_eq!(snap.unresolved.len(), 2);
    }
}
