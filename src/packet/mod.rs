//! # Packet Classification
//!
//! Every advertisement the radio hears arrives as a [`ScanEvent`]: a hex payload plus
//! the scan metadata (source address, RSSI, arrival time, advertised name). [`classify`]
//! turns it into a typed [`Packet`] or rejects it. Rejection is plain data: the caller
//! drops the event and moves on. Nothing in this module panics on short or malformed
//! input.
//!
//! ## Signature table
//!
//! Families are told apart by the group id byte (hex chars 8..10) and, inside the
//! shared bridge management space (`EE`), by the message type nibble:
//!
//! | Test (in order)                                  | Kind                    |
//! |--------------------------------------------------|-------------------------|
//! | connectable, name `WLT_<12 hex>`                 | `BridgeEarly`           |
//! | prefix `90FC`, group `EB`                        | `ExternalSensor`        |
//! | prefix `90FC`                                    | `Data`                  |
//! | group matches `3F`/`3D`/`3C` mask                | `CombinedSi`            |
//! | group `EB`                                       | `ExternalSensor`        |
//! | group `EC`                                       | `Meta`                  |
//! | group `ED`                                       | `Control`               |
//! | group `EE`, msg 1/5/6, api >= 5, module 0         | `BridgeConfig(V5)`      |
//! | group `EE`, msg 1/5/6, major version 3           | `BridgeConfig(V3)`      |
//! | group `EE`, msg 1/5/6, module > 0                | `ModuleExchange`        |
//! | group `EE`, msg 1/5/6                            | `BridgeConfig(V2)`      |
//! | group `EE`, msg 4/7                              | `BridgeAck`             |
//! | group `EE`, msg 2, api >= 5                      | `BridgeHeartbeat(V5)`   |
//! | group `EE`, msg 2                                | `BridgeHeartbeat(V1)`   |
//! | anything else                                    | `Data`                  |
//!
//! Field access goes through the tables in [`layouts`], so decoding and the encoders in
//! [`codec`] share one description of each family.

pub mod bridge_status;
pub mod codec;
pub mod fields;
pub mod layouts;
pub mod radio;

use serde::{Deserialize, Serialize};

use fields::Layout;

/// Length in hex chars of a legacy (BLE4) advertisement payload.
pub const DATA_PACKET_LEN: usize = 58;

const GROUP_SENSOR: u64 = 0xEB;
const GROUP_META: u64 = 0xEC;
const GROUP_CONTROL: u64 = 0xED;
const GROUP_BRIDGE: u64 = 0xEE;
const COMBINED_SI_MASKS: [u64; 3] = [0x3F, 0x3D, 0x3C];

const MSG_CFG_SET: u64 = 1;
const MSG_HB: u64 = 2;
const MSG_LED_BLINK: u64 = 4;
const MSG_ASSIGN_ID: u64 = 5;
const MSG_CFG_GET: u64 = 6;
const MSG_BRG_ACTION: u64 = 7;

/// One radio reception, as handed over by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub payload: String,
    pub address: String,
    pub rssi: i32,
    /// Arrival time, epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub connectable: bool,
}

impl ScanEvent {
    pub fn new(payload: impl Into<String>, address: impl Into<String>, rssi: i32, timestamp: i64) -> Self {
        Self {
            payload: payload.into(),
            address: address.into(),
            rssi,
            timestamp,
            name: None,
            connectable: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>, connectable: bool) -> Self {
        self.name = Some(name.into());
        self.connectable = connectable;
        self
    }
}

/// Data packet origin, from the 16-bit service id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPacketType {
    Direct,
    Retransmitted,
    Sensor,
    ShortMd,
    ShortSd,
    Unknown,
}

impl DataPacketType {
    pub fn prefix(&self) -> &'static str {
        match self {
            DataPacketType::Direct => "AFFD",
            DataPacketType::Retransmitted => "C6FC",
            DataPacketType::Sensor => "90FC",
            DataPacketType::ShortMd => "0500",
            DataPacketType::ShortSd => "05AF",
            DataPacketType::Unknown => "",
        }
    }

    pub fn from_payload(payload: &str) -> Self {
        let head = payload.get(..4).unwrap_or("");
        [
            DataPacketType::Direct,
            DataPacketType::Retransmitted,
            DataPacketType::Sensor,
            DataPacketType::ShortMd,
            DataPacketType::ShortSd,
        ]
        .into_iter()
        .find(|t| head.eq_ignore_ascii_case(t.prefix()))
        .unwrap_or(DataPacketType::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigVersion {
    V2,
    V3,
    V5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeartbeatVersion {
    V1,
    V5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Pixel data. Directly heard when the prefix is `AFFD`.
    Data,
    /// Combined data + side info echo relayed by a bridge (or the virtual bridge).
    CombinedSi,
    /// Legacy side info packet.
    Meta,
    ExternalSensor,
    Control,
    BridgeConfig(ConfigVersion),
    BridgeHeartbeat(HeartbeatVersion),
    ModuleExchange,
    BridgeAck,
    BridgeEarly,
}

impl PacketKind {
    pub fn is_bridge_family(&self) -> bool {
        matches!(
            self,
            PacketKind::BridgeConfig(_)
                | PacketKind::BridgeHeartbeat(_)
                | PacketKind::ModuleExchange
                | PacketKind::BridgeEarly
        )
    }
}

/// Identity used to absorb repeated receptions of one advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    kind: PacketKind,
    value: String,
    address: Option<String>,
}

/// A classified packet. Only the raw payload and scan metadata are stored; every other
/// field is read from the payload on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    /// Uppercase hex. Empty for early bridge advertisements.
    pub payload: String,
    pub address: String,
    pub rssi: i32,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn group_id(payload: &str) -> Option<u64> {
    fields::read_bits(payload, 32, 8)
}

fn byte_at(payload: &str, char_offset: usize) -> Option<u64> {
    fields::read_bits(payload, char_offset * 4, 8)
}

fn early_bridge_id(name: &str) -> Option<&str> {
    let mut parts = name.split('_');
    let prefix = parts.next()?;
    let id = parts.next()?;
    (prefix.starts_with("WLT") && id.len() == 12).then_some(id)
}

/// Extended advertisements arrive as a full AD structure (`<len>16<service id>...`);
/// legacy frames start directly at the service id. Field offsets are relative to the
/// service id in both cases.
fn frame_body(payload: &str) -> &str {
    if payload.len() != DATA_PACKET_LEN && payload.get(2..4) == Some("16") {
        payload.get(4..).unwrap_or(payload)
    } else {
        payload
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Classify a scan event. Returns `None` for anything the gateway does not understand.
pub fn classify(event: &ScanEvent) -> Option<Packet> {
    if event.connectable {
        if let Some(name) = event.name.as_deref() {
            if early_bridge_id(name).is_some() {
                return Some(Packet {
                    kind: PacketKind::BridgeEarly,
                    payload: String::new(),
                    address: event.address.clone(),
                    rssi: event.rssi,
                    timestamp: event.timestamp,
                    name: Some(name.to_string()),
                });
            }
        }
    }

    let payload = event.payload.trim().to_ascii_uppercase();
    if !is_hex(&payload) || payload.len() % 2 != 0 {
        return None;
    }
    // Anything shorter than the legacy frame cannot carry the fixed offsets below.
    if payload.len() < DATA_PACKET_LEN {
        return None;
    }

    let kind = classify_payload(frame_body(&payload))?;
    Some(Packet {
        kind,
        payload,
        address: event.address.clone(),
        rssi: event.rssi,
        timestamp: event.timestamp,
        name: event.name.clone(),
    })
}

fn classify_payload(payload: &str) -> Option<PacketKind> {
    let group = group_id(payload)?;
    let type_byte = byte_at(payload, 10)?;
    let msg_type = type_byte & 0x0F;
    let module_type = type_byte & 0xF0;
    let api_or_board = byte_at(payload, 12)?;
    let is_v5_plus = api_or_board >= 5 && module_type == 0;
    let is_v3 = byte_at(payload, 40)? == 3 && !is_v5_plus;

    if DataPacketType::from_payload(payload) == DataPacketType::Sensor {
        return Some(if group == GROUP_SENSOR {
            PacketKind::ExternalSensor
        } else {
            PacketKind::Data
        });
    }
    if COMBINED_SI_MASKS.iter().any(|m| group & m == *m) {
        return Some(PacketKind::CombinedSi);
    }
    let kind = match group {
        GROUP_SENSOR => PacketKind::ExternalSensor,
        GROUP_META => PacketKind::Meta,
        GROUP_CONTROL => PacketKind::Control,
        GROUP_BRIDGE => match msg_type {
            MSG_CFG_SET | MSG_ASSIGN_ID | MSG_CFG_GET => {
                if is_v5_plus {
                    PacketKind::BridgeConfig(ConfigVersion::V5)
                } else if is_v3 {
                    PacketKind::BridgeConfig(ConfigVersion::V3)
                } else if module_type > 0 {
                    PacketKind::ModuleExchange
                } else {
                    PacketKind::BridgeConfig(ConfigVersion::V2)
                }
            }
            MSG_LED_BLINK | MSG_BRG_ACTION => PacketKind::BridgeAck,
            MSG_HB if api_or_board >= 5 => PacketKind::BridgeHeartbeat(HeartbeatVersion::V5),
            MSG_HB => PacketKind::BridgeHeartbeat(HeartbeatVersion::V1),
            _ => PacketKind::Data,
        },
        _ => PacketKind::Data,
    };
    Some(kind)
}

impl Packet {
    /// Field table for this packet's family, if it has one.
    pub fn layout(&self) -> Option<&'static Layout> {
        Some(match self.kind {
            PacketKind::CombinedSi => &layouts::ECHO,
            PacketKind::Meta => &layouts::META,
            PacketKind::ExternalSensor => &layouts::EXTERNAL_SENSOR,
            PacketKind::Control => &layouts::CONTROL,
            PacketKind::BridgeConfig(ConfigVersion::V2) => &layouts::CONFIG_V2,
            PacketKind::BridgeConfig(ConfigVersion::V3) => &layouts::CONFIG_V3,
            PacketKind::BridgeConfig(ConfigVersion::V5) => &layouts::CONFIG_V5,
            PacketKind::BridgeHeartbeat(HeartbeatVersion::V1) => &layouts::HEARTBEAT_V1,
            PacketKind::BridgeHeartbeat(HeartbeatVersion::V5) => &layouts::HEARTBEAT,
            PacketKind::ModuleExchange => &layouts::MODULE_EXCHANGE,
            PacketKind::Data | PacketKind::BridgeAck | PacketKind::BridgeEarly => return None,
        })
    }

    /// Read a named field of this packet's family.
    pub fn field(&self, name: &str) -> Option<u64> {
        self.layout()?.get(self.body(), name)
    }

    pub fn mac_field(&self, name: &str) -> Option<String> {
        self.layout()?.get_mac(self.body(), name)
    }

    /// Payload from the service id on.
    pub fn body(&self) -> &str {
        frame_body(&self.payload)
    }

    pub fn dedup_key(&self) -> DedupKey {
        match self.kind {
            PacketKind::BridgeEarly => DedupKey {
                kind: self.kind,
                value: self.name.clone().unwrap_or_default(),
                address: None,
            },
            PacketKind::CombinedSi | PacketKind::Meta | PacketKind::ExternalSensor => DedupKey {
                kind: self.kind,
                value: self.payload.clone(),
                address: Some(self.address.clone()),
            },
            _ => DedupKey {
                kind: self.kind,
                value: self.payload.clone(),
                address: None,
            },
        }
    }

    pub fn data_type(&self) -> DataPacketType {
        DataPacketType::from_payload(self.body())
    }

    pub fn is_direct(&self) -> bool {
        self.kind == PacketKind::Data && self.data_type() == DataPacketType::Direct
    }

    /// Extended advertisement (anything other than the 29 byte legacy frame).
    pub fn is_ble5(&self) -> bool {
        self.kind != PacketKind::BridgeEarly && self.payload.len() != DATA_PACKET_LEN
    }

    /// Source address without separators, used as the relaying bridge alias.
    pub fn alias_id(&self) -> String {
        self.address.replace(':', "").to_ascii_uppercase()
    }

    pub fn api_version(&self) -> Option<u64> {
        match self.kind {
            PacketKind::BridgeConfig(ConfigVersion::V3) | PacketKind::BridgeConfig(ConfigVersion::V2) => None,
            PacketKind::ExternalSensor
            | PacketKind::BridgeConfig(_)
            | PacketKind::BridgeHeartbeat(_)
            | PacketKind::ModuleExchange => self.field("api_version"),
            _ => None,
        }
    }

    /// The bridge this packet describes or was relayed by.
    pub fn bridge_id(&self) -> Option<String> {
        let id = match self.kind {
            PacketKind::Meta | PacketKind::ExternalSensor => self.mac_field("bridge_mac"),
            PacketKind::BridgeHeartbeat(HeartbeatVersion::V1)
            | PacketKind::BridgeConfig(_)
            | PacketKind::Control => self.mac_field("src_mac"),
            PacketKind::BridgeHeartbeat(HeartbeatVersion::V5) | PacketKind::ModuleExchange => {
                self.mac_field("brg_mac")
            }
            PacketKind::BridgeEarly => self
                .name
                .as_deref()
                .and_then(early_bridge_id)
                .map(|s| s.to_ascii_uppercase()),
            PacketKind::CombinedSi => Some(self.alias_id()),
            PacketKind::Data | PacketKind::BridgeAck => None,
        }?;
        Some(id.to_ascii_uppercase())
    }

    /// `major.minor.patch`, decimal, for config packets.
    pub fn firmware_version(&self) -> Option<String> {
        match self.kind {
            PacketKind::BridgeConfig(_) => Some(format!(
                "{}.{}.{}",
                self.field("major")?,
                self.field("minor")?,
                self.field("patch")?
            )),
            _ => None,
        }
    }

    pub fn board_type(&self) -> Option<u64> {
        match self.kind {
            PacketKind::BridgeConfig(ConfigVersion::V3) | PacketKind::BridgeConfig(ConfigVersion::V5) => {
                self.field("board_type")
            }
            _ => None,
        }
    }

    /// Uppercase MAC of the pixel that sent a data packet, from the scan address.
    pub fn device_mac(&self) -> String {
        self.address.to_ascii_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(payload: &str) -> ScanEvent {
        ScanEvent::new(payload, "AA:BB:CC:DD:EE:FF", -60, 1_000)
    }

    #[test]
    fn rejects_short_and_non_hex() {
        assert!(classify(&ev("AFFD00")).is_none());
        assert!(classify(&ev(&"ZZ".repeat(29))).is_none());
        assert!(classify(&ev("")).is_none());
    }

    #[test]
    fn early_bridge_needs_connectable_name() {
        let e = ev("").with_name("WLT_0A1B2C3D4E5F", true);
        let p = classify(&e).expect("early");
        assert_eq!(p.kind, PacketKind::BridgeEarly);
        assert_eq!(p.bridge_id().as_deref(), Some("0A1B2C3D4E5F"));

        let not_connectable = ev("").with_name("WLT_0A1B2C3D4E5F", false);
        assert!(classify(&not_connectable).is_none());
    }

    #[test]
    fn lowercase_payload_is_normalized() {
        let p = classify(&ev("affd0200005ef94aa9f15878aa1a776c7e906ae707158b06966ab6f5b9")).expect("data");
        assert_eq!(p.kind, PacketKind::Data);
        assert!(p.is_direct());
        assert!(p.payload.starts_with("AFFD"));
    }
}
