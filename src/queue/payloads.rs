//! JSON payloads published to the broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{DataOutputFilter, GatewayConfig};
use crate::packet::{DataPacketType, Packet, PacketKind};

/// AD structure header for a 29 byte service data frame.
pub const AD_PREFIX: &str = "1E16";

/// Bridges from this api version on are reported under their alias.
const ALIAS_MIN_API: u64 = 9;

/// Process-wide upload sequence. Cloned handles share one counter.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

fn with_ad_prefix(payload: &str) -> String {
    if payload.starts_with(AD_PREFIX) {
        payload.to_string()
    } else {
        format!("{}{}", AD_PREFIX, payload)
    }
}

/// One entry of the `packets` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub payload: String,
    pub sequence_id: u64,
    pub rssi: i32,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_bridge_id: Option<String>,
    #[serde(skip)]
    pub retransmitted: bool,
}

impl UploadItem {
    /// Bridge management traffic: heartbeats, module exchange, config packets.
    pub fn edge(packet: &Packet, seq: &SequenceCounter) -> Self {
        let alias = match packet.kind {
            PacketKind::BridgeConfig(_) => None,
            _ => packet
                .api_version()
                .filter(|v| *v >= ALIAS_MIN_API)
                .map(|_| packet.alias_id()),
        };
        Self {
            payload: with_ad_prefix(&packet.payload.to_ascii_uppercase()),
            sequence_id: seq.next(),
            rssi: packet.rssi,
            timestamp: packet.timestamp,
            alias_bridge_id: alias,
            retransmitted: false,
        }
    }

    /// Pixel traffic. `None` for packets the cloud does not take, i.e. neither relayed
    /// nor tied to a bridge alias.
    pub fn data(packet: &Packet, seq: &SequenceCounter) -> Option<Self> {
        let payload = packet.payload.to_ascii_uppercase();
        let (payload, alias, retransmitted) = if packet.kind == PacketKind::CombinedSi {
            let payload = if packet.is_ble5() {
                payload
            } else {
                with_ad_prefix(&payload)
            };
            (payload, Some(packet.alias_id()), true)
        } else {
            match packet.data_type() {
                DataPacketType::Retransmitted | DataPacketType::Sensor => (with_ad_prefix(&payload), None, true),
                _ => return None,
            }
        };
        Some(Self {
            payload,
            sequence_id: seq.next(),
            rssi: packet.rssi,
            timestamp: packet.timestamp,
            alias_bridge_id: alias,
            retransmitted,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Envelope for the data topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEnvelope {
    pub gateway_id: String,
    pub gateway_type: String,
    pub gateway_name: String,
    pub timestamp: i64,
    pub packets: Vec<UploadItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl GatewayEnvelope {
    pub fn new(gateway: &GatewayConfig, packets: Vec<UploadItem>, timestamp: i64) -> Self {
        Self {
            gateway_id: gateway.gateway_id.clone(),
            gateway_type: gateway.gateway_type.clone(),
            gateway_name: gateway.gateway_name.clone(),
            timestamp,
            packets,
            location: None,
        }
    }
}

/// Settings reported in capabilities and heartbeat messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedSettings {
    pub pacing_period_ms: u64,
    pub upstream_enabled: bool,
    pub upload_pixels_traffic: bool,
    pub upload_configuration_traffic: bool,
    pub ble_logs_enabled: bool,
    pub data_mode: DataOutputFilter,
}

/// Versions and identity of the emulated bridge chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    /// Colon separated, as reported by the emulator.
    pub ble_mac: String,
    pub ble_version: String,
    pub interface_version: String,
}

fn gateway_conf(gateway: &GatewayConfig, settings: &ReportedSettings) -> Value {
    json!({
        "additional": {
            "pacingPeriod": settings.pacing_period_ms / 1000,
            "upstreamEnabled": settings.upstream_enabled,
            "uploadPixelsTraffic": settings.upload_pixels_traffic,
            "uploadConfigurationTraffic": settings.upload_configuration_traffic,
            "bleLogsEnabled": settings.ble_logs_enabled,
            "versionName": gateway.app_version,
            "gwDataMode": settings.data_mode.serial(),
        },
        "gatewayVersion": gateway.app_version,
    })
}

pub fn capabilities(gateway: &GatewayConfig, settings: &ReportedSettings) -> Value {
    json!({
        "gatewayId": gateway.gateway_id,
        "gatewayType": gateway.gateway_type,
        "gatewayConf": gateway_conf(gateway, settings),
        "tagMetadataCouplingSupported": false,
        "downlinkSupported": true,
        "bridgeOtaUpgradeSupported": gateway.cloud_managed,
        "fwUpgradeSupported": false,
    })
}

pub fn heartbeat(gateway: &GatewayConfig, settings: &ReportedSettings, chip: Option<&ChipInfo>) -> Value {
    let mut msg = capabilities(gateway, settings);
    if let (Some(chip), Some(obj)) = (chip, msg.as_object_mut()) {
        obj.insert(
            "gatewayInfo".to_string(),
            json!({
                "bleChipMacAddress": chip.ble_mac.replace(':', ""),
                "bleChipSwVersion": chip.ble_version,
                "interfaceChipSwVersion": chip.interface_version,
            }),
        );
    }
    msg
}

pub fn logs(lines: &[String]) -> Value {
    json!({ "gatewayLogs": lines })
}

/// Last will left on the status topic.
pub fn will() -> Value {
    logs(&["WLT_INFO: Connection lost".to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{classify, ScanEvent};

    const HB_V5: &str = "AFFD0000EE02058CD66B9C0AA8DB0052EA00472C0090F030C600110000";
    const CONFIG_V5: &str = "C6FC0000EE010859000600120200E76A825D40880310600F061903000A";
    const SI: &str = "C6FC02003F000000000000000000000000000013F000000000BA0D7557";
    const DIRECT: &str = "AFFD0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9";

    fn packet(payload: &str) -> Packet {
        classify(&ScanEvent::new(payload, "0a:1b:2c:3d:4e:5f", -40, 7)).unwrap()
    }

    #[test]
    fn edge_items_are_wrapped() {
        let seq = SequenceCounter::default();
        let hb = UploadItem::edge(&packet(HB_V5), &seq);
        assert_eq!(hb.payload, format!("1E16{}", HB_V5));
        assert_eq!(hb.alias_bridge_id, None, "api 5 has no alias");
        let cfg = UploadItem::edge(&packet(CONFIG_V5), &seq);
        assert_eq!(cfg.sequence_id, 1);
        assert!(cfg.alias_bridge_id.is_none());
    }

    #[test]
    fn data_items_need_relay_or_alias() {
        let seq = SequenceCounter::default();
        let echo = UploadItem::data(&packet(SI), &seq).expect("echo");
        assert_eq!(echo.alias_bridge_id.as_deref(), Some("0A1B2C3D4E5F"));
        assert!(echo.payload.starts_with("1E16C6FC"));
        assert!(UploadItem::data(&packet(DIRECT), &seq).is_none());

        let json = serde_json::to_value(&echo).unwrap();
        assert_eq!(json["aliasBridgeId"], "0A1B2C3D4E5F");
        assert_eq!(json["sequenceId"], 0);
        assert!(json.get("retransmitted").is_none());
    }

    #[test]
    fn heartbeat_carries_chip_info() {
        let gw = GatewayConfig {
            gateway_id: "GW1".into(),
            app_version: "1.2.3".into(),
            ..crate::config::Config::default().gateway
        };
        let settings = ReportedSettings {
            pacing_period_ms: 15_000,
            upstream_enabled: true,
            upload_pixels_traffic: true,
            upload_configuration_traffic: true,
            ble_logs_enabled: false,
            data_mode: DataOutputFilter::BridgesAndPixels,
        };
        let chip = ChipInfo {
            ble_mac: "0A:1B:2C:3D:4E:5F".into(),
            ble_version: "1.2.3".into(),
            interface_version: "1.2.3".into(),
        };
        let msg = heartbeat(&gw, &settings, Some(&chip));
        assert_eq!(msg["gatewayInfo"]["bleChipMacAddress"], "0A1B2C3D4E5F");
        assert_eq!(msg["gatewayConf"]["additional"]["pacingPeriod"], 15);
        assert_eq!(msg["downlinkSupported"], true);
        assert_eq!(will()["gatewayLogs"][0], "WLT_INFO: Connection lost");
    }
}
