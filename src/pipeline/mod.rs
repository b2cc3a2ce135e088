//! # Ingestion Pipeline
//!
//! Single mailbox actor between the radio and everything else. Each scan event is
//! classified, dropped or placed in a per-family pending set keyed by its dedup identity.
//! Repeated receptions of one advertisement collapse into the first one seen.
//!
//! A periodic map (and an eager one when an event arrives a full tick after the previous
//! map) moves items that are old enough out of the pending sets and fans them out as
//! [`Dispatch`] values:
//!
//! * data, meta and side info wait `filter_window_ms` so duplicates can coalesce;
//! * bridge config, heartbeat, module and early bridge items wait `management_window_ms`;
//! * acknowledgements leave on the next map.
//!
//! The pure part lives in [`PipelineState`]; [`start_pipeline`] wraps it in a task.

pub mod traffic;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::clock::now_millis;
use crate::config::TimingConfig;
use crate::logutil::escape_log;
use crate::metrics;
use crate::packet::bridge_status::{fold_by_id, BridgeStatus};
use crate::packet::{classify, DedupKey, Packet, PacketKind, ScanEvent};

pub use traffic::{Family, TrafficPolicy};

/// One typed batch leaving the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// At most one merged status per bridge id.
    Bridges(Vec<BridgeStatus>),
    /// Heartbeats, one per source bridge.
    Heartbeats(Vec<Packet>),
    Modules(Vec<Packet>),
    EarlyBridges(Vec<Packet>),
    /// Gateway log lines for received bridge acknowledgements.
    Acks(Vec<String>),
    /// Directly heard pixel packets for the virtual bridge.
    DirectPixels(Vec<Packet>),
    /// Pixel packets to resolve.
    Resolve(Vec<Packet>),
    /// Data, meta and side info to upload.
    Upload(Vec<Packet>),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub filter_window_ms: u64,
    pub management_window_ms: u64,
    pub tick_ms: u64,
}

impl PipelineConfig {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            filter_window_ms: timing.filter_window_ms(),
            management_window_ms: timing.management_window_ms(),
            tick_ms: timing.pipeline_tick_ms(),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_timing(&TimingConfig::default())
    }
}

type Pending = HashMap<DedupKey, Packet>;

/// Pending sets and the time of the last map.
#[derive(Debug, Default)]
pub struct PipelineState {
    data: Pending,
    meta: Pending,
    bridge: Pending,
    heartbeat: Pending,
    module: Pending,
    early: Pending,
    acks: Pending,
    last_map: i64,
}

/// Remove and return every item at least `window_ms` old.
fn take_expired(pending: &mut Pending, now: i64, window_ms: u64) -> Vec<Packet> {
    let window = window_ms as i64;
    let expired: Vec<DedupKey> = pending
        .iter()
        .filter(|(_, p)| now - p.timestamp >= window)
        .map(|(k, _)| k.clone())
        .collect();
    let mut out: Vec<Packet> = expired.iter().filter_map(|k| pending.remove(k)).collect();
    out.sort_by_key(|p| p.timestamp);
    out
}

impl PipelineState {
    pub fn new(now: i64) -> Self {
        Self {
            last_map: now,
            ..Self::default()
        }
    }

    /// Buffer a classified packet. Returns false when the policy drops it or an identical
    /// packet is already pending.
    pub fn ingest(&mut self, packet: Packet, policy: &TrafficPolicy) -> bool {
        let Some(family) = policy.family(&packet) else {
            return false;
        };
        let pending = match family {
            Family::Data => &mut self.data,
            Family::Meta => &mut self.meta,
            Family::BridgeConfig => &mut self.bridge,
            Family::Heartbeat => &mut self.heartbeat,
            Family::Module => &mut self.module,
            Family::Early => &mut self.early,
            Family::Ack => &mut self.acks,
        };
        let key = packet.dedup_key();
        if pending.contains_key(&key) {
            return false;
        }
        pending.insert(key, packet);
        true
    }

    pub fn pending(&self) -> usize {
        [
            &self.data,
            &self.meta,
            &self.bridge,
            &self.heartbeat,
            &self.module,
            &self.early,
            &self.acks,
        ]
        .iter()
        .map(|p| p.len())
        .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// True once a full tick has passed since the previous map.
    pub fn map_due(&self, now: i64, cfg: &PipelineConfig) -> bool {
        now - self.last_map >= cfg.tick_ms as i64
    }

    /// Move everything old enough out of the pending sets.
    pub fn map(&mut self, now: i64, cfg: &PipelineConfig, policy: &TrafficPolicy) -> Vec<Dispatch> {
        self.last_map = now;
        let mut out = Vec::new();
        if self.is_empty() {
            return out;
        }

        let data = take_expired(&mut self.data, now, cfg.filter_window_ms);
        let meta = take_expired(&mut self.meta, now, cfg.filter_window_ms);
        let configs = take_expired(&mut self.bridge, now, cfg.management_window_ms);
        let heartbeats = take_expired(&mut self.heartbeat, now, cfg.management_window_ms);
        let modules = take_expired(&mut self.module, now, cfg.management_window_ms);
        let early = take_expired(&mut self.early, now, cfg.management_window_ms);

        if !self.acks.is_empty() {
            let mut acks: Vec<Packet> = self.acks.drain().map(|(_, p)| p).collect();
            acks.sort_by_key(|p| p.timestamp);
            out.push(Dispatch::Acks(
                acks.iter()
                    .map(|p| format!("WLT_INFO: ReceivedAction={}", p.payload))
                    .collect(),
            ));
        }

        let statuses = fold_by_id(
            configs
                .iter()
                .chain(
                    meta.iter()
                        .filter(|p| p.kind == PacketKind::Meta && policy.retransmitted()),
                )
                .chain(modules.iter())
                .chain(heartbeats.iter())
                .filter_map(BridgeStatus::from_packet),
        );
        if !statuses.is_empty() {
            out.push(Dispatch::Bridges(statuses));
        }

        if !heartbeats.is_empty() {
            let mut seen = HashSet::new();
            let distinct: Vec<Packet> = heartbeats
                .into_iter()
                .filter(|p| seen.insert(p.bridge_id().unwrap_or_else(|| p.alias_id())))
                .collect();
            out.push(Dispatch::Heartbeats(distinct));
        }
        if !modules.is_empty() {
            out.push(Dispatch::Modules(modules));
        }
        if !early.is_empty() {
            out.push(Dispatch::EarlyBridges(early));
        }

        if data.is_empty() && meta.is_empty() {
            return out;
        }

        let (direct, relayed): (Vec<Packet>, Vec<Packet>) = data.iter().cloned().partition(|p| p.is_direct());
        if policy.direct() && !direct.is_empty() {
            out.push(Dispatch::DirectPixels(direct));
        }
        if policy.resolve_enabled && !data.is_empty() {
            out.push(Dispatch::Resolve(data));
        }

        let (side_info, meta): (Vec<Packet>, Vec<Packet>) =
            meta.into_iter().partition(|p| p.kind == PacketKind::CombinedSi);
        let mut upload = Vec::new();
        if policy.retransmitted() {
            upload.extend(relayed);
            upload.extend(meta);
        }
        upload.extend(side_info.into_iter().filter(|p| policy.accepts_side_info(p)));
        if !upload.is_empty() {
            upload.sort_by_key(|p| p.timestamp);
            out.push(Dispatch::Upload(upload));
        }
        out
    }
}

pub enum PipelineCommand {
    Scan(ScanEvent),
    /// Already classified packet, e.g. one synthesized by the virtual bridge.
    Packet(Packet),
    SetPolicy(TrafficPolicy),
    Snapshot(oneshot::Sender<PipelineStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub pending: usize,
    pub received: u64,
    pub unrecognized: u64,
    /// Duplicates plus packets the policy refused.
    pub dropped: u64,
    pub maps: u64,
    pub dispatched: u64,
}

#[derive(Clone, Debug)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl PipelineHandle {
    pub fn ingest(&self, event: ScanEvent) {
        let _ = self.tx.send(PipelineCommand::Scan(event));
    }

    pub fn ingest_packet(&self, packet: Packet) {
        let _ = self.tx.send(PipelineCommand::Packet(packet));
    }

    pub fn set_policy(&self, policy: TrafficPolicy) {
        let _ = self.tx.send(PipelineCommand::SetPolicy(policy));
    }

    pub async fn snapshot(&self) -> Option<PipelineStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PipelineCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(PipelineCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

fn emit(
    batches: Vec<Dispatch>,
    outgoing: &mpsc::UnboundedSender<Dispatch>,
    stats: &mut PipelineStats,
) {
    stats.maps += 1;
    for batch in batches {
        stats.dispatched += 1;
        metrics::inc_batches_forwarded();
        let _ = outgoing.send(batch);
    }
}

pub fn start_pipeline(
    cfg: PipelineConfig,
    policy: TrafficPolicy,
    outgoing: mpsc::UnboundedSender<Dispatch>,
) -> PipelineHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<PipelineCommand>();
    let handle = PipelineHandle { tx };

    tokio::spawn(async move {
        let mut state = PipelineState::new(now_millis());
        let mut policy = policy;
        let mut stats = PipelineStats::default();
        let mut tick = tokio::time::interval(cfg.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let packet = match cmd {
                        PipelineCommand::Scan(event) => {
                            stats.received += 1;
                            metrics::inc_scans_received();
                            match classify(&event) {
                                Some(p) => Some(p),
                                None => {
                                    stats.unrecognized += 1;
                                    metrics::inc_scans_unrecognized();
                                    log::trace!("unrecognized payload {}", escape_log(&event.payload));
                                    None
                                }
                            }
                        }
                        PipelineCommand::Packet(p) => Some(p),
                        PipelineCommand::SetPolicy(p) => {
                            log::info!("pipeline policy updated: {:?}", p);
                            policy = p;
                            None
                        }
                        PipelineCommand::Snapshot(resp) => {
                            let _ = resp.send(PipelineStats { pending: state.pending(), ..stats.clone() });
                            None
                        }
                        PipelineCommand::Shutdown(done) => {
                            let _ = done.send(());
                            break;
                        }
                    };
                    if let Some(packet) = packet {
                        if !state.ingest(packet, &policy) {
                            stats.dropped += 1;
                        }
                        let now = now_millis();
                        if state.map_due(now, &cfg) {
                            emit(state.map(now, &cfg, &policy), &outgoing, &mut stats);
                        }
                    }
                }
                _ = tick.tick() => {
                    emit(state.map(now_millis(), &cfg, &policy), &outgoing, &mut stats);
                }
            }
        }
        log::debug!("pipeline loop terminated");
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataOutputFilter;

    const HB: &str = "AFFD0000EE02015DDEEDCD9D8A76AEEF895320C1001E04460008000000";
    const DIRECT: &str = "AFFD0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9";

    fn packet(payload: &str, ts: i64) -> Packet {
        classify(&ScanEvent::new(payload, "AA:BB:CC:DD:EE:FF", -50, ts)).unwrap()
    }

    fn cfg() -> PipelineConfig {
        PipelineConfig {
            filter_window_ms: 200,
            management_window_ms: 1000,
            tick_ms: 1000,
        }
    }

    #[test]
    fn windows_hold_young_items() {
        let mut state = PipelineState::new(0);
        let policy = TrafficPolicy::default();
        assert!(state.ingest(packet(DIRECT, 1000), &policy));
        assert!(state.ingest(packet(HB, 1000), &policy));

        assert!(state.map(1100, &cfg(), &policy).is_empty());
        let out = state.map(1200, &cfg(), &policy);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Dispatch::DirectPixels(v) if v.len() == 1));
        assert_eq!(state.pending(), 1);

        let out = state.map(2000, &cfg(), &policy);
        assert!(out.iter().any(|d| matches!(d, Dispatch::Heartbeats(_))));
        assert!(out.iter().any(|d| matches!(d, Dispatch::Bridges(s) if s[0].id == "AEEF895320C1")));
        assert!(state.is_empty());
    }

    #[test]
    fn repeated_reception_is_absorbed() {
        let mut state = PipelineState::new(0);
        let policy = TrafficPolicy::default();
        assert!(state.ingest(packet(DIRECT, 10), &policy));
        assert!(!state.ingest(packet(DIRECT, 20), &policy));
        assert_eq!(state.pending(), 1);
    }

    #[test]
    fn meta_feeds_bridge_status_only_with_relayed_traffic() {
        const META: &str = "C6FC0000ECE76A825D40880000460000000000000000000000A87B15EC";
        let pixels_only = TrafficPolicy {
            filter: DataOutputFilter::PixelsOnly,
            ..TrafficPolicy::default()
        };
        let mut state = PipelineState::new(0);
        assert!(state.ingest(packet(META, 1000), &pixels_only));
        let out = state.map(1200, &cfg(), &pixels_only);
        assert!(!out.iter().any(|d| matches!(d, Dispatch::Bridges(_))));
        assert!(!out.iter().any(|d| matches!(d, Dispatch::Upload(_))));

        let policy = TrafficPolicy::default();
        let mut state = PipelineState::new(0);
        assert!(state.ingest(packet(META, 1000), &policy));
        let out = state.map(1200, &cfg(), &policy);
        assert!(out.iter().any(|d| matches!(d, Dispatch::Bridges(s) if s.len() == 1)));
        assert!(out.iter().any(|d| matches!(d, Dispatch::Upload(u) if u.len() == 1)));
    }

    #[test]
    fn map_due_after_full_tick() {
        let state = PipelineState::new(5_000);
        assert!(!state.map_due(5_999, &cfg()));
        assert!(state.map_due(6_000, &cfg()));
    }
}
