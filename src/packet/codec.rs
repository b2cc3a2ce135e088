//! Encoders and decoders for the packets the virtual bridge emits and consumes.
//!
//! Each family is a plain struct implementing [`LayoutFields`], which maps it to and
//! from the generic field table in [`super::layouts`]. Encoding writes the family header,
//! every field, and zero padding up to 29 bytes; decoding reads the same bits back.

use sha2::{Digest, Sha256};

use super::fields::{self, parse_mac, FieldValues, Layout};
use super::layouts::{self, HEADER_CONTROL};
use super::{HeartbeatVersion, Packet, PacketKind, DATA_PACKET_LEN};

pub const API_VERSION: u64 = 10;
pub const VIRTUAL_BOARD_TYPE: u64 = 17;

const MODULE_INTERFACE: u64 = 1;
const MODULE_DATAPATH: u64 = 2;
const MSG_HEARTBEAT: u64 = 2;
const MSG_INTERFACE: u64 = 1;
const MSG_DATAPATH: u64 = 5;
const ACTION_GET_MODULE: u64 = 3;

/// A struct backed by one field table.
pub trait LayoutFields: Sized {
    const LAYOUT: &'static Layout;

    fn to_values(&self) -> FieldValues;
    fn from_values(values: &FieldValues) -> Option<Self>;

    fn encode(&self) -> String {
        Self::LAYOUT.encode(&self.to_values())
    }

    fn decode(payload: &str) -> Option<Self> {
        Self::from_values(&Self::LAYOUT.decode(payload)?)
    }
}

fn mac_value(mac: &str) -> u64 {
    parse_mac(mac).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub api_version: u64,
    pub seq_id: u64,
    pub brg_mac: String,
    pub non_wlt_rx: u64,
    pub bad_crc: u64,
    pub wlt_rx: u64,
    pub wlt_tx: u64,
    pub tags: u64,
    pub tx_queue_watermark: u64,
    pub dynamic: bool,
    pub effective_pacer: u64,
}

impl LayoutFields for Heartbeat {
    const LAYOUT: &'static Layout = &layouts::HEARTBEAT;

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("msg_type", MSG_HEARTBEAT)
            .with("api_version", self.api_version)
            .with("seq_id", self.seq_id)
            .with("brg_mac", mac_value(&self.brg_mac))
            .with("non_wlt_rx", self.non_wlt_rx)
            .with("bad_crc", self.bad_crc)
            .with("wlt_rx", self.wlt_rx)
            .with("wlt_tx", self.wlt_tx)
            .with("tags", self.tags)
            .with("tx_queue_watermark", self.tx_queue_watermark)
            .with("dynamic", u64::from(self.dynamic))
            .with("effective_pacer", self.effective_pacer)
    }

    fn from_values(v: &FieldValues) -> Option<Self> {
        Some(Self {
            api_version: v.get("api_version")?,
            seq_id: v.get("seq_id")?,
            brg_mac: fields::mac_string(v.get("brg_mac")?),
            non_wlt_rx: v.get("non_wlt_rx")?,
            bad_crc: v.get("bad_crc")?,
            wlt_rx: v.get("wlt_rx")?,
            wlt_tx: v.get("wlt_tx")?,
            tags: v.get("tags")?,
            tx_queue_watermark: v.get("tx_queue_watermark")?,
            dynamic: v.get("dynamic")? == 1,
            effective_pacer: v.get("effective_pacer")?,
        })
    }
}

/// Counters carried by an api v1 heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatV1 {
    pub seq_id: u64,
    pub src_mac: String,
    pub sent_pkts: u64,
    pub non_wlt_pkts: u64,
    pub tags: u64,
}

impl HeartbeatV1 {
    pub fn decode(payload: &str) -> Option<Self> {
        let l = &layouts::HEARTBEAT_V1;
        Some(Self {
            seq_id: l.get(payload, "seq_id")?,
            src_mac: l.get_mac(payload, "src_mac")?,
            sent_pkts: l.get(payload, "sent_pkts")?,
            non_wlt_pkts: l.get(payload, "non_wlt_pkts")?,
            tags: l.get(payload, "tags")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub glob: bool,
    pub datapath: bool,
    pub energy_2400: bool,
    pub energy_sub1g: bool,
    pub calibration: bool,
    pub pwr_mgmt: bool,
    pub sensors: bool,
    pub custom: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    pub api_version: u64,
    pub seq_id: u64,
    pub brg_mac: String,
    pub board_type: u64,
    pub bl_version: u64,
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub capabilities: Capabilities,
    pub cfg_hash: u32,
}

impl LayoutFields for Interface {
    const LAYOUT: &'static Layout = &layouts::INTERFACE;

    fn to_values(&self) -> FieldValues {
        let c = &self.capabilities;
        FieldValues::new()
            .with("module_type", MODULE_INTERFACE)
            .with("msg_type", MSG_INTERFACE)
            .with("api_version", self.api_version)
            .with("seq_id", self.seq_id)
            .with("brg_mac", mac_value(&self.brg_mac))
            .with("board_type", self.board_type)
            .with("bl_version", self.bl_version)
            .with("major", self.major)
            .with("minor", self.minor)
            .with("patch", self.patch)
            .with("cap_glob", u64::from(c.glob))
            .with("cap_datapath", u64::from(c.datapath))
            .with("cap_energy_2400", u64::from(c.energy_2400))
            .with("cap_energy_sub1g", u64::from(c.energy_sub1g))
            .with("cap_calibration", u64::from(c.calibration))
            .with("cap_pwr_mgmt", u64::from(c.pwr_mgmt))
            .with("cap_sensors", u64::from(c.sensors))
            .with("cap_custom", u64::from(c.custom))
            .with("cfg_hash", u64::from(self.cfg_hash))
    }

    fn from_values(v: &FieldValues) -> Option<Self> {
        let flag = |name: &str| v.get(name).map(|b| b == 1);
        Some(Self {
            api_version: v.get("api_version")?,
            seq_id: v.get("seq_id")?,
            brg_mac: fields::mac_string(v.get("brg_mac")?),
            board_type: v.get("board_type")?,
            bl_version: v.get("bl_version")?,
            major: v.get("major")?,
            minor: v.get("minor")?,
            patch: v.get("patch")?,
            capabilities: Capabilities {
                glob: flag("cap_glob")?,
                datapath: flag("cap_datapath")?,
                energy_2400: flag("cap_energy_2400")?,
                energy_sub1g: flag("cap_energy_sub1g")?,
                calibration: flag("cap_calibration")?,
                pwr_mgmt: flag("cap_pwr_mgmt")?,
                sensors: flag("cap_sensors")?,
                custom: flag("cap_custom")?,
            },
            cfg_hash: u32::try_from(v.get("cfg_hash")?).ok()?,
        })
    }
}

/// Datapath module configuration, both as announced and as commanded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Datapath {
    pub api_version: u64,
    pub seq_id: u64,
    pub brg_mac: String,
    pub global_pacing_group: u64,
    pub adaptive_pacer: bool,
    pub unified_echo: bool,
    /// Seconds.
    pub pacer_interval: u64,
    pub pkt_filter: u64,
    pub tx_repetition: u64,
    pub comm_output_power: u64,
    pub comm_pattern: u64,
}

impl LayoutFields for Datapath {
    const LAYOUT: &'static Layout = &layouts::DATAPATH;

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("module_type", MODULE_DATAPATH)
            .with("msg_type", MSG_DATAPATH)
            .with("api_version", self.api_version)
            .with("seq_id", self.seq_id)
            .with("brg_mac", mac_value(&self.brg_mac))
            .with("global_pacing_group", self.global_pacing_group)
            .with("adaptive_pacer", u64::from(self.adaptive_pacer))
            .with("unified_echo", u64::from(self.unified_echo))
            .with("pacer_interval", self.pacer_interval)
            .with("pkt_filter", self.pkt_filter)
            .with("tx_repetition", self.tx_repetition)
            .with("comm_output_power", self.comm_output_power)
            .with("comm_pattern", self.comm_pattern)
    }

    fn from_values(v: &FieldValues) -> Option<Self> {
        Some(Self {
            api_version: v.get("api_version")?,
            seq_id: v.get("seq_id")?,
            brg_mac: fields::mac_string(v.get("brg_mac")?),
            global_pacing_group: v.get("global_pacing_group")?,
            adaptive_pacer: v.get("adaptive_pacer")? == 1,
            unified_echo: v.get("unified_echo")? == 1,
            pacer_interval: v.get("pacer_interval")?,
            pkt_filter: v.get("pkt_filter")?,
            tx_repetition: v.get("tx_repetition")?,
            comm_output_power: v.get("comm_output_power")?,
            comm_pattern: v.get("comm_pattern")?,
        })
    }
}

impl Datapath {
    pub fn module_type(payload: &str) -> Option<u64> {
        layouts::DATAPATH.get(payload, "module_type")
    }

    /// Parse a datapath set command. The command may be wrapped in an AD header, so the
    /// control signature is located first.
    pub fn parse_command(payload: &str) -> Option<Self> {
        let upper = payload.to_ascii_uppercase();
        let start = upper.find(HEADER_CONTROL)?;
        let body = &upper[start..];
        let module = layouts::DATAPATH_SET.get(body, "module_type")?;
        let msg = layouts::DATAPATH_SET.get(body, "msg_type")?;
        if module != MODULE_DATAPATH || msg != MSG_DATAPATH {
            return None;
        }
        Self::from_values(&layouts::DATAPATH_SET.decode(body)?)
    }

    /// Encode as a set command addressed to a bridge.
    pub fn encode_command(&self) -> String {
        layouts::DATAPATH_SET.encode(&self.to_values())
    }
}

/// Modules requested by a get-module action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleRequest {
    pub interface: bool,
    pub datapath: bool,
}

impl ModuleRequest {
    /// Parse a get-module action addressed to `brg_mac` (12 hex chars, no separators).
    pub fn parse(payload: &str, brg_mac: &str) -> Option<Self> {
        let upper = payload.to_ascii_uppercase();
        let target = format!("{}{:02X}", brg_mac.to_ascii_uppercase(), ACTION_GET_MODULE);
        if !upper.contains(&target) {
            return None;
        }
        let start = upper.find(HEADER_CONTROL)?;
        let body = &upper[start..];
        let l = &layouts::GET_MODULE;
        if l.get_mac(body, "brg_mac")? != brg_mac.to_ascii_uppercase()
            || l.get(body, "action")? != ACTION_GET_MODULE
        {
            return None;
        }
        Some(Self {
            interface: l.get(body, "want_interface")? == 1,
            datapath: l.get(body, "want_datapath")? == 1,
        })
    }

    pub fn encode(&self, seq_id: u64, brg_mac: &str) -> String {
        layouts::GET_MODULE.encode(
            &FieldValues::new()
                .with("msg_type", 7)
                .with("api_version", API_VERSION)
                .with("seq_id", seq_id)
                .with("brg_mac", mac_value(brg_mac))
                .with("action", ACTION_GET_MODULE)
                .with("want_interface", u64::from(self.interface))
                .with("want_datapath", u64::from(self.datapath)),
        )
    }
}

/// Side info appended to a relayed pixel packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EchoMeta {
    /// Receptions folded into this echo, saturating at 255.
    pub nfpkt: u64,
    /// 6-bit encoded RSSI, see [`encode_rssi`].
    pub rssi: u64,
    pub brg_latency: u64,
    pub global_pacing: u64,
}

impl EchoMeta {
    pub fn new(counter: u64, rssi: i32) -> Self {
        Self {
            nfpkt: counter.min(255),
            rssi: encode_rssi(rssi),
            brg_latency: 0,
            global_pacing: 0,
        }
    }

    fn packed(&self) -> u32 {
        ((self.nfpkt as u32 & 0xFF) << 16)
            | ((self.rssi as u32 & 0x3F) << 10)
            | ((self.brg_latency as u32 & 0x3F) << 4)
            | (self.global_pacing as u32 & 0x0F)
    }

    pub fn decode(payload: &str) -> Option<Self> {
        let l = &layouts::ECHO;
        Some(Self {
            nfpkt: l.get(payload, "nfpkt")?,
            rssi: l.get(payload, "rssi")?,
            brg_latency: l.get(payload, "brg_latency")?,
            global_pacing: l.get(payload, "global_pacing")?,
        })
    }
}

/// Relayed RSSI encoding: `-(rssi + 40)`, truncated to 6 bits.
pub fn encode_rssi(rssi: i32) -> u64 {
    (-(rssi + 40)) as u64 & 0x3F
}

/// Turn a directly heard pixel payload into an echo packet payload.
///
/// Legacy frames keep their length: the service id becomes `C6FC`, the group id is OR-ed
/// with `0x3F`, and bytes 15..18 carry the meta. Extended frames get the meta appended and
/// their AD length byte bumped by three.
pub fn encode_echo(payload: &str, meta: &EchoMeta) -> Option<String> {
    let upper = payload.to_ascii_uppercase();
    if upper.len() == DATA_PACKET_LEN {
        let group = fields::read_bits(&upper, 32, 8)?;
        let l = &layouts::ECHO;
        l.patch(
            &upper,
            &FieldValues::new()
                .with("prefix", 0xC6FC)
                .with("group_id", group | 0x3F)
                .with("nfpkt", meta.nfpkt)
                .with("rssi", meta.rssi)
                .with("brg_latency", meta.brg_latency)
                .with("global_pacing", meta.global_pacing),
        )
    } else {
        if upper.len() < 8 || upper.len() % 2 != 0 {
            return None;
        }
        let length = u8::from_str_radix(upper.get(0..2)?, 16).ok()?;
        Some(format!(
            "{:02X}{}C6FC{}{:06X}",
            length.wrapping_add(3),
            upper.get(2..4)?,
            upper.get(8..)?,
            meta.packed()
        ))
    }
}

/// Derive the virtual bridge MAC from the gateway id: the first six bytes of the id's
/// SHA-256, forced to a locally administered unicast address. Colon separated.
pub fn virtual_bridge_mac(gateway_id: &str) -> String {
    let digest = Sha256::digest(gateway_id.as_bytes());
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&digest[..6]);
    mac[0] = (mac[0] & 0xFE) | 0x02;
    mac.iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Hash announced in the interface packet, derived from the pacing configuration so a
/// configuration change is visible upstream.
pub fn config_hash(pacing_ms: u64) -> u32 {
    ((pacing_ms ^ (pacing_ms >> 32)) as u32).wrapping_neg()
}

/// `(major, minor, patch)` of a dotted version string; missing parts are zero.
pub fn version_parts(version: &str) -> (u64, u64, u64) {
    let mut parts = version
        .split(['.', '-', '+'])
        .map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Wrap a payload the virtual bridge produced as a packet from `brg_mac`.
pub fn synthetic_packet(kind: PacketKind, payload: String, brg_mac: &str, timestamp: i64) -> Packet {
    Packet {
        kind,
        payload,
        address: brg_mac.replace(':', "").to_ascii_uppercase(),
        rssi: 0,
        timestamp,
        name: None,
    }
}

pub const HEARTBEAT_KIND: PacketKind = PacketKind::BridgeHeartbeat(HeartbeatVersion::V5);
