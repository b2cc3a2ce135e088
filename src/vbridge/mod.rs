//! # Virtual Bridge
//!
//! Emulates a bridge on the gateway itself so that directly heard pixels reach the cloud
//! the same way relayed ones do. Every tag gets one echo as soon as it is first heard;
//! after that its receptions are counted and folded into one echo per pacing interval.
//!
//! The emulator announces itself like real hardware: a heartbeat with the reception
//! counters since the previous one, a periodic interface packet and the datapath
//! configuration on request. Its pacing can be changed over the downlink.
//!
//! Emitted packets are handed back to the caller as classified [`Packet`]s sourced from
//! the virtual bridge MAC, ready to be fed into the ingestion pipeline.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::clock::now_millis;
use crate::config::Config;
use crate::logutil::escape_log;
use crate::metrics;
use crate::packet::codec::{
    config_hash, encode_echo, synthetic_packet, version_parts, virtual_bridge_mac, Capabilities, Datapath, EchoMeta,
    Heartbeat, Interface, LayoutFields, ModuleRequest, API_VERSION, HEARTBEAT_KIND, VIRTUAL_BOARD_TYPE,
};
use crate::packet::{Packet, PacketKind};

/// Accepted pacer interval range, seconds.
pub const PACER_RANGE: std::ops::RangeInclusive<u64> = 1..=65_000;

const SEQ_MODULO: u64 = 255;

#[derive(Debug, Clone)]
pub struct VBridgeConfig {
    /// Colon separated.
    pub brg_mac: String,
    pub app_version: String,
    pub tick_ms: u64,
    pub pacing_ms: u64,
    pub eviction_floor_ms: u64,
    pub heartbeat: Duration,
    pub interface: Duration,
    pub config_reply: Duration,
}

impl VBridgeConfig {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.timing;
        Self {
            brg_mac: virtual_bridge_mac(&config.gateway.gateway_id),
            app_version: config.gateway.app_version.clone(),
            tick_ms: t.vbridge_tick_ms(),
            pacing_ms: config.initial_pacing_ms(),
            eviction_floor_ms: t.vbridge_eviction_floor_ms(),
            heartbeat: t.vbridge_heartbeat(),
            interface: t.vbridge_interface(),
            config_reply: t.vbridge_config_reply(),
        }
    }

    /// MAC without separators, as it appears inside packets.
    pub fn compact_mac(&self) -> String {
        self.brg_mac.replace(':', "").to_ascii_uppercase()
    }
}

#[derive(Debug, Clone)]
struct PixelGroup {
    /// Latest reception not yet echoed.
    last_packet: Option<Packet>,
    last_pace: i64,
    /// Receptions folded into the next echo.
    counter: u64,
    last_seen: i64,
}

/// Pacing state of the emulator. Time is passed in explicitly.
#[derive(Debug)]
pub struct VBridgeState {
    brg_mac: String,
    app_version: String,
    pacing_ms: u64,
    eviction_floor_ms: u64,
    groups: HashMap<String, PixelGroup>,
    seq: u64,
    received: u64,
    sent: u64,
    last_heartbeat: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VBridgeStats {
    pub groups: usize,
    pub seq: u64,
    pub received: u64,
    pub sent: u64,
    pub pacing_ms: u64,
}

impl VBridgeState {
    pub fn new(cfg: &VBridgeConfig, now: i64) -> Self {
        Self {
            brg_mac: cfg.brg_mac.clone(),
            app_version: cfg.app_version.clone(),
            pacing_ms: cfg.pacing_ms,
            eviction_floor_ms: cfg.eviction_floor_ms,
            groups: HashMap::new(),
            seq: 0,
            received: 0,
            sent: 0,
            last_heartbeat: now,
        }
    }

    pub fn pacing_ms(&self) -> u64 {
        self.pacing_ms
    }

    pub fn stats(&self) -> VBridgeStats {
        VBridgeStats {
            groups: self.groups.len(),
            seq: self.seq,
            received: self.received,
            sent: self.sent,
            pacing_ms: self.pacing_ms,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq = (self.seq + 1) % SEQ_MODULO;
        self.seq
    }

    /// Paced echoes and module packets advance the sequence and the sent counter.
    /// Heartbeats and first-seen echoes do not count as sent.
    fn count_sent(&mut self, n: u64) -> u64 {
        self.sent += n;
        self.seq = (self.seq + n) % SEQ_MODULO;
        self.seq
    }

    fn echo(&mut self, packet: &Packet, counter: u64, now: i64) -> Option<Packet> {
        let Some(payload) = encode_echo(&packet.payload, &EchoMeta::new(counter, packet.rssi)) else {
            log::debug!("cannot echo {}", escape_log(&packet.payload));
            return None;
        };
        metrics::inc_echoes_emitted();
        Some(synthetic_packet(PacketKind::CombinedSi, payload, &self.brg_mac, now))
    }

    /// Take one directly heard pixel packet. Returns the echo of a first-seen tag.
    pub fn direct(&mut self, packet: Packet, now: i64) -> Option<Packet> {
        self.received += 1;
        let tag = packet.device_mac();
        match self.groups.get_mut(&tag) {
            Some(group) => {
                group.counter += 1;
                group.last_seen = packet.timestamp;
                group.last_packet = Some(packet);
                None
            }
            None => {
                let echo = self.echo(&packet, 0, now);
                self.groups.insert(
                    tag,
                    PixelGroup {
                        last_packet: None,
                        last_pace: packet.timestamp,
                        counter: 0,
                        last_seen: packet.timestamp,
                    },
                );
                echo
            }
        }
    }

    /// Echo every tag whose pacing interval has elapsed, and forget tags that have been
    /// quiet for longer than the eviction age.
    pub fn pace(&mut self, now: i64) -> Vec<Packet> {
        let due = now - self.pacing_ms as i64;
        let dead = now - self.pacing_ms.max(self.eviction_floor_ms) as i64;
        let mut ready = Vec::new();
        self.groups.retain(|_, g| {
            if g.last_pace <= due {
                if let Some(p) = g.last_packet.take() {
                    ready.push((p, g.counter));
                    g.last_pace = now;
                    g.counter = 0;
                    return true;
                }
            }
            !(g.last_packet.is_none() && g.last_pace <= dead)
        });
        let echoes: Vec<Packet> = ready
            .into_iter()
            .filter_map(|(p, counter)| self.echo(&p, counter, now))
            .collect();
        self.count_sent(echoes.len() as u64);
        echoes
    }

    /// Heartbeat with the counters since the previous one, which are then reset.
    pub fn heartbeat(&mut self, now: i64) -> Packet {
        let since = self.last_heartbeat;
        let tags = self.groups.values().filter(|g| g.last_seen >= since).count() as u64;
        let hb = Heartbeat {
            api_version: API_VERSION,
            seq_id: self.next_seq(),
            brg_mac: self.brg_mac.clone(),
            wlt_rx: self.received,
            wlt_tx: self.sent,
            tags,
            effective_pacer: self.pacing_ms / 1000,
            ..Heartbeat::default()
        };
        self.received = 0;
        self.sent = 0;
        self.last_heartbeat = now;
        metrics::inc_heartbeats_emitted();
        synthetic_packet(HEARTBEAT_KIND, hb.encode(), &self.brg_mac, now)
    }

    pub fn interface(&mut self, now: i64) -> Packet {
        let (major, minor, patch) = version_parts(&self.app_version);
        let iface = Interface {
            api_version: API_VERSION,
            seq_id: self.count_sent(1),
            brg_mac: self.brg_mac.clone(),
            board_type: VIRTUAL_BOARD_TYPE,
            bl_version: 0,
            major,
            minor,
            patch,
            capabilities: Capabilities {
                datapath: true,
                ..Capabilities::default()
            },
            cfg_hash: config_hash(self.pacing_ms),
        };
        synthetic_packet(PacketKind::ModuleExchange, iface.encode(), &self.brg_mac, now)
    }

    pub fn configuration(&mut self, now: i64) -> Packet {
        let datapath = Datapath {
            api_version: API_VERSION,
            seq_id: self.count_sent(1),
            brg_mac: self.brg_mac.clone(),
            unified_echo: true,
            pacer_interval: self.pacing_ms / 1000,
            ..Datapath::default()
        };
        synthetic_packet(PacketKind::ModuleExchange, datapath.encode(), &self.brg_mac, now)
    }

    /// Apply a pacer interval in seconds. Out of range values are refused.
    pub fn set_pacer_interval(&mut self, secs: u64) -> bool {
        if !PACER_RANGE.contains(&secs) {
            log::warn!("ignoring pacer interval {} s outside {:?}", secs, PACER_RANGE);
            return false;
        }
        self.pacing_ms = secs * 1000;
        log::info!("virtual bridge pacing now {} ms", self.pacing_ms);
        true
    }
}

/// What a downlink means for the virtual bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VBridgeRequest {
    GetModules(ModuleRequest),
    SetPacer(u64),
}

impl VBridgeRequest {
    /// Parse a raw downlink addressed to `compact_mac`. `None` when it is for someone else.
    pub fn parse(raw: &str, compact_mac: &str) -> Option<Self> {
        if let Some(req) = ModuleRequest::parse(raw, compact_mac) {
            return Some(Self::GetModules(req));
        }
        let cmd = Datapath::parse_command(raw)?;
        (cmd.brg_mac.replace(':', "").eq_ignore_ascii_case(compact_mac)).then_some(Self::SetPacer(cmd.pacer_interval))
    }
}

pub enum VBridgeCommand {
    Direct(Vec<Packet>),
    Downlink(String),
    SetPacer(u64),
    AnnounceConfiguration,
    Snapshot(oneshot::Sender<VBridgeStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct VBridgeHandle {
    tx: mpsc::UnboundedSender<VBridgeCommand>,
    brg_mac: String,
}

impl VBridgeHandle {
    /// Colon separated MAC of the emulated bridge.
    pub fn mac(&self) -> &str {
        &self.brg_mac
    }

    pub fn direct(&self, packets: Vec<Packet>) {
        if !packets.is_empty() {
            let _ = self.tx.send(VBridgeCommand::Direct(packets));
        }
    }

    pub fn downlink(&self, raw: String) {
        let _ = self.tx.send(VBridgeCommand::Downlink(raw));
    }

    /// Pacing pushed through gateway configuration rather than a bridge command.
    pub fn set_pacer_interval(&self, secs: u64) {
        let _ = self.tx.send(VBridgeCommand::SetPacer(secs));
    }

    pub fn announce_configuration(&self) {
        let _ = self.tx.send(VBridgeCommand::AnnounceConfiguration);
    }

    pub async fn snapshot(&self) -> Option<VBridgeStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(VBridgeCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(VBridgeCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

fn emit(outgoing: &mpsc::UnboundedSender<Packet>, packets: impl IntoIterator<Item = Packet>) {
    for p in packets {
        let _ = outgoing.send(p);
    }
}

fn schedule_announce(mailbox: &mpsc::WeakUnboundedSender<VBridgeCommand>, delay: Duration) {
    let mailbox = mailbox.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(tx) = mailbox.upgrade() {
            let _ = tx.send(VBridgeCommand::AnnounceConfiguration);
        }
    });
}

pub fn start_virtual_bridge(cfg: VBridgeConfig, outgoing: mpsc::UnboundedSender<Packet>) -> VBridgeHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<VBridgeCommand>();
    let mailbox = tx.downgrade();
    let handle = VBridgeHandle {
        tx,
        brg_mac: cfg.brg_mac.clone(),
    };

    tokio::spawn(async move {
        let compact = cfg.compact_mac();
        let mut state = VBridgeState::new(&cfg, now_millis());
        let mut last_pace_run = now_millis();
        let tick_ms = cfg.tick_ms.max(1);

        let start = tokio::time::Instant::now();
        let mut pacer = tokio::time::interval(Duration::from_millis(tick_ms));
        pacer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval_at(start + cfg.heartbeat, cfg.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick is immediate: announce on start
        let mut interface = tokio::time::interval(cfg.interface);
        interface.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("virtual bridge {} up, pacing {} ms", cfg.brg_mac, state.pacing_ms());
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        VBridgeCommand::Direct(packets) => {
                            let now = now_millis();
                            let echoes: Vec<Packet> = packets.into_iter().filter_map(|p| state.direct(p, now)).collect();
                            emit(&outgoing, echoes);
                            if now - last_pace_run >= tick_ms as i64 {
                                last_pace_run = now;
                                emit(&outgoing, state.pace(now));
                            }
                        }
                        VBridgeCommand::Downlink(raw) => match VBridgeRequest::parse(&raw, &compact) {
                            Some(VBridgeRequest::GetModules(req)) => {
                                let now = now_millis();
                                if req.interface {
                                    emit(&outgoing, [state.interface(now)]);
                                }
                                if req.datapath {
                                    emit(&outgoing, [state.configuration(now)]);
                                }
                            }
                            Some(VBridgeRequest::SetPacer(secs)) => {
                                if state.set_pacer_interval(secs) {
                                    schedule_announce(&mailbox, cfg.config_reply);
                                }
                            }
                            None => log::debug!("downlink not for virtual bridge: {}", escape_log(&raw)),
                        },
                        VBridgeCommand::SetPacer(secs) => {
                            if secs.saturating_mul(1000) != state.pacing_ms() && state.set_pacer_interval(secs) {
                                schedule_announce(&mailbox, cfg.config_reply);
                            }
                        }
                        VBridgeCommand::AnnounceConfiguration => {
                            emit(&outgoing, [state.configuration(now_millis())]);
                        }
                        VBridgeCommand::Snapshot(resp) => {
                            let _ = resp.send(state.stats());
                        }
                        VBridgeCommand::Shutdown(done) => {
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                _ = pacer.tick() => {
                    let now = now_millis();
                    last_pace_run = now;
                    emit(&outgoing, state.pace(now));
                }
                _ = heartbeat.tick() => {
                    emit(&outgoing, [state.heartbeat(now_millis())]);
                }
                _ = interface.tick() => {
                    emit(&outgoing, [state.interface(now_millis())]);
                }
            }
        }
        log::debug!("virtual bridge loop terminated");
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{classify, ScanEvent};

    const DIRECT: &str = "AFFD0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9";

    fn cfg() -> VBridgeConfig {
        VBridgeConfig {
            brg_mac: virtual_bridge_mac("GW-1"),
            app_version: "1.4.2".into(),
            tick_ms: 1000,
            pacing_ms: 10_000,
            eviction_floor_ms: 30_000,
            heartbeat: Duration::from_secs(30),
            interface: Duration::from_secs(60),
            config_reply: Duration::from_millis(500),
        }
    }

    fn tag(address: &str, ts: i64) -> Packet {
        classify(&ScanEvent::new(DIRECT, address, -60, ts)).unwrap()
    }

    #[test]
    fn first_reception_echoes_immediately() {
        let mut s = VBridgeState::new(&cfg(), 0);
        let echo = s.direct(tag("11:22:33:44:55:66", 100), 100).expect("echo");
        assert_eq!(echo.kind, PacketKind::CombinedSi);
        assert_eq!(echo.address, cfg().compact_mac());
        assert!(s.direct(tag("11:22:33:44:55:66", 200), 200).is_none());
        assert_eq!(s.stats().sent, 0);
        assert_eq!(s.stats().seq, 0);
        assert_eq!(s.stats().received, 2);
    }

    #[test]
    fn pacing_folds_receptions() {
        let mut s = VBridgeState::new(&cfg(), 0);
        s.direct(tag("11:22:33:44:55:66", 0), 0);
        for ts in [1_000, 2_000, 3_000] {
            s.direct(tag("11:22:33:44:55:66", ts), ts);
        }
        assert!(s.pace(9_999).is_empty());
        let out = s.pace(10_000);
        assert_eq!(out.len(), 1);
        let meta = EchoMeta::decode(out[0].body()).unwrap();
        assert_eq!(meta.nfpkt, 3);
        // nothing new since: no echo on the next interval
        assert!(s.pace(20_000).is_empty());
    }

    #[test]
    fn quiet_tags_are_evicted_after_floor() {
        let mut s = VBridgeState::new(&cfg(), 0);
        s.direct(tag("11:22:33:44:55:66", 0), 0);
        s.pace(29_999);
        assert_eq!(s.stats().groups, 1);
        s.pace(30_000);
        assert_eq!(s.stats().groups, 0);
    }

    #[test]
    fn heartbeat_counts_since_previous_and_resets() {
        let mut s = VBridgeState::new(&cfg(), 0);
        s.direct(tag("11:22:33:44:55:66", 10), 10);
        s.direct(tag("11:22:33:44:55:77", 10), 10);
        s.direct(tag("11:22:33:44:55:77", 20), 20);
        let hb = s.heartbeat(30);
        let decoded = Heartbeat::decode(hb.body()).unwrap();
        assert_eq!(decoded.wlt_rx, 3);
        assert_eq!(decoded.wlt_tx, 0);
        assert_eq!(decoded.tags, 2);
        assert_eq!(decoded.effective_pacer, 10);
        assert_eq!(s.stats().received, 0);
        assert_eq!(s.stats().sent, 0);
        let again = Heartbeat::decode(s.heartbeat(40).body()).unwrap();
        assert_eq!(again.tags, 0);
    }

    #[test]
    fn paced_echoes_and_module_packets_count_as_sent() {
        let mut s = VBridgeState::new(&cfg(), 0);
        s.direct(tag("11:22:33:44:55:66", 0), 0);
        s.direct(tag("11:22:33:44:55:66", 1_000), 1_000);
        assert_eq!(s.pace(10_000).len(), 1);
        s.interface(10_000);
        s.configuration(10_000);
        assert_eq!(s.stats().sent, 3);
        assert_eq!(s.stats().seq, 3);

        let hb = Heartbeat::decode(s.heartbeat(10_500).body()).unwrap();
        assert_eq!(hb.wlt_tx, 3);
        assert_eq!(hb.seq_id, 4);
        assert_eq!(s.stats().sent, 0);
    }

    #[test]
    fn sequence_wraps_below_255() {
        let mut s = VBridgeState::new(&cfg(), 0);
        for _ in 0..254 {
            s.interface(0);
        }
        assert_eq!(s.stats().seq, 254);
        s.interface(0);
        assert_eq!(s.stats().seq, 0);
    }

    #[test]
    fn pacer_range_is_enforced() {
        let mut s = VBridgeState::new(&cfg(), 0);
        assert!(!s.set_pacer_interval(0));
        assert!(!s.set_pacer_interval(65_001));
        assert_eq!(s.pacing_ms(), 10_000);
        assert!(s.set_pacer_interval(65_000));
        assert_eq!(s.pacing_ms(), 65_000_000);
    }

    #[test]
    fn interface_announces_version_and_hash() {
        let mut s = VBridgeState::new(&cfg(), 0);
        let p = s.interface(0);
        let iface = Interface::decode(p.body()).unwrap();
        assert_eq!(iface.board_type, VIRTUAL_BOARD_TYPE);
        assert_eq!((iface.major, iface.minor, iface.patch), (1, 4, 2));
        assert!(iface.capabilities.datapath);
        assert_eq!(iface.cfg_hash, config_hash(10_000));
    }
}
