//! Traffic policy: which classified packets the pipeline buffers and where they go.

use crate::config::{Config, DataOutputFilter};
use crate::packet::{Packet, PacketKind};

/// Pending set a packet lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Data,
    /// Meta, external sensor and combined side info.
    Meta,
    BridgeConfig,
    Heartbeat,
    Module,
    Early,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficPolicy {
    pub enable_data: bool,
    pub enable_edge: bool,
    pub filter: DataOutputFilter,
    pub resolve_enabled: bool,
    /// Virtual bridge MAC, 12 uppercase hex chars.
    pub vbridge_mac: Option<String>,
}

impl Default for TrafficPolicy {
    fn default() -> Self {
        Self {
            enable_data: true,
            enable_edge: true,
            filter: DataOutputFilter::default(),
            resolve_enabled: false,
            vbridge_mac: None,
        }
    }
}

impl TrafficPolicy {
    pub fn from_config(config: &Config, vbridge_mac: Option<&str>) -> Self {
        Self {
            enable_data: config.traffic.enable_data_traffic,
            enable_edge: config.traffic.enable_edge_traffic,
            filter: config.traffic.data_output_filter,
            resolve_enabled: config.traffic.resolve_enabled,
            vbridge_mac: vbridge_mac.map(normalize_mac),
        }
    }

    /// Directly heard pixel packets are forwarded (through the virtual bridge).
    pub fn direct(&self) -> bool {
        self.enable_data && self.filter != DataOutputFilter::BridgesOnly
    }

    /// Packets retransmitted by physical bridges are forwarded.
    pub fn retransmitted(&self) -> bool {
        self.enable_data && self.filter != DataOutputFilter::PixelsOnly
    }

    pub fn any(&self) -> bool {
        self.direct() && self.retransmitted()
    }

    pub fn is_from_vbridge(&self, packet: &Packet) -> bool {
        self.vbridge_mac
            .as_deref()
            .is_some_and(|mac| normalize_mac(&packet.address) == mac)
    }

    /// Pending set for `packet`, or `None` when the policy drops it at ingress.
    pub fn family(&self, packet: &Packet) -> Option<Family> {
        let (family, gated_by_data) = match packet.kind {
            PacketKind::Data => (Family::Data, true),
            PacketKind::Meta | PacketKind::ExternalSensor | PacketKind::CombinedSi => (Family::Meta, true),
            PacketKind::BridgeConfig(_) => (Family::BridgeConfig, false),
            PacketKind::BridgeHeartbeat(_) => (Family::Heartbeat, false),
            PacketKind::ModuleExchange => (Family::Module, false),
            PacketKind::BridgeEarly => (Family::Early, false),
            PacketKind::BridgeAck => return Some(Family::Ack),
            PacketKind::Control => return None,
        };
        let enabled = if gated_by_data {
            self.enable_data
        } else {
            self.enable_edge
        };
        enabled.then_some(family)
    }

    /// Whether a combined side info packet is uploaded under the current filter.
    pub fn accepts_side_info(&self, packet: &Packet) -> bool {
        if self.any() {
            true
        } else if self.direct() {
            self.is_from_vbridge(packet)
        } else {
            !self.is_from_vbridge(packet)
        }
    }
}

fn normalize_mac(mac: &str) -> String {
    mac.replace(':', "").to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{classify, ScanEvent};

    const SI: &str = "C6FC02003F000000000000000000000000000013F000000000BA0D7557";

    fn policy(filter: DataOutputFilter) -> TrafficPolicy {
        TrafficPolicy {
            filter,
            vbridge_mac: Some("0A1B2C3D4E5F".into()),
            ..TrafficPolicy::default()
        }
    }

    #[test]
    fn rules_follow_filter() {
        let p = policy(DataOutputFilter::PixelsOnly);
        assert!(p.direct() && !p.retransmitted() && !p.any());
        let p = policy(DataOutputFilter::BridgesOnly);
        assert!(!p.direct() && p.retransmitted());
        let mut p = policy(DataOutputFilter::BridgesAndPixels);
        assert!(p.any());
        p.enable_data = false;
        assert!(!p.direct() && !p.retransmitted());
    }

    #[test]
    fn side_info_split_by_source() {
        let own = classify(&ScanEvent::new(SI, "0a:1b:2c:3d:4e:5f", -50, 0)).unwrap();
        let other = classify(&ScanEvent::new(SI, "11:22:33:44:55:66", -50, 0)).unwrap();

        let pixels = policy(DataOutputFilter::PixelsOnly);
        assert!(pixels.accepts_side_info(&own));
        assert!(!pixels.accepts_side_info(&other));

        let bridges = policy(DataOutputFilter::BridgesOnly);
        assert!(!bridges.accepts_side_info(&own));
        assert!(bridges.accepts_side_info(&other));
    }

    #[test]
    fn edge_gate_drops_bridge_families_only() {
        let hb = classify(&ScanEvent::new(
            "AFFD0000EE02015DDEEDCD9D8A76AEEF895320C1001E04460008000000",
            "AA:BB:CC:DD:EE:FF",
            -50,
            0,
        ))
        .unwrap();
        let mut p = TrafficPolicy::default();
        assert_eq!(p.family(&hb), Some(Family::Heartbeat));
        p.enable_edge = false;
        assert_eq!(p.family(&hb), None);
    }
}
