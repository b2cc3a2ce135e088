//! Messages received on the update topic.
//!
//! Three shapes share the topic and are told apart by their top level key: `action`,
//! then `gatewayConf`, then `customBroker`.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{CustomBrokerConfig, DataOutputFilter};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownlinkError {
    #[error("downlink is not valid JSON: {0}")]
    Malformed(String),
    #[error("downlink has no action, gatewayConf or customBroker key")]
    UnknownShape,
    #[error("downlink {kind} message has unexpected fields: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeAction {
    Advertise,
    BridgeOta,
    PrepareBridgeImage,
    RebootBridge,
    UpgradeBridge,
    ClearImages,
    Unknown,
}

impl BridgeAction {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Advertise,
            1 => Self::BridgeOta,
            2 => Self::PrepareBridgeImage,
            3 => Self::RebootBridge,
            4 => Self::UpgradeBridge,
            5 => Self::ClearImages,
            _ => Self::Unknown,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Advertise => 0,
            Self::BridgeOta => 1,
            Self::PrepareBridgeImage => 2,
            Self::RebootBridge => 3,
            Self::UpgradeBridge => 4,
            Self::ClearImages => 5,
            Self::Unknown => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    #[serde(default)]
    protocol_version: Option<i64>,
    action: Value,
    #[serde(default)]
    gateway_id: Option<String>,
    #[serde(default)]
    tx_packet: Option<String>,
    #[serde(default)]
    tx_max_duration_ms: Option<u64>,
    #[serde(default)]
    tx_max_retries: Option<u32>,
    #[serde(default)]
    image_dir_url: Option<String>,
    #[serde(default)]
    upgrade_bl_sd: Option<bool>,
    #[serde(default)]
    bridge_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionMessage {
    pub protocol_version: Option<i64>,
    pub action: BridgeAction,
    pub gateway_id: Option<String>,
    /// Hex packet to advertise.
    pub tx_packet: Option<String>,
    pub tx_max_duration_ms: Option<u64>,
    pub tx_max_retries: Option<u32>,
    pub image_dir_url: Option<String>,
    pub upgrade_bootloader: Option<bool>,
    pub bridge_id: Option<String>,
}

impl From<RawAction> for ActionMessage {
    fn from(raw: RawAction) -> Self {
        let (action, tx_packet, tx_max_duration_ms) = match &raw.action {
            Value::Number(n) => (
                n.as_i64().map_or(BridgeAction::Unknown, BridgeAction::from_code),
                raw.tx_packet.clone(),
                raw.tx_max_duration_ms,
            ),
            Value::String(s) if s.starts_with('-') => (
                s.trim().parse::<i64>().map_or(BridgeAction::Unknown, BridgeAction::from_code),
                raw.tx_packet.clone(),
                raw.tx_max_duration_ms,
            ),
            // "<cmd> <txPacket> ... <durationMs>"
            Value::String(s) => {
                let tokens: Vec<&str> = s.split(' ').collect();
                let packet = tokens.get(1).map(|t| t.to_string()).or_else(|| raw.tx_packet.clone());
                let duration = tokens
                    .last()
                    .and_then(|t| t.parse::<u64>().ok())
                    .or(raw.tx_max_duration_ms);
                (BridgeAction::Advertise, packet, duration)
            }
            _ => (BridgeAction::Unknown, raw.tx_packet.clone(), raw.tx_max_duration_ms),
        };
        Self {
            protocol_version: raw.protocol_version,
            action,
            gateway_id: raw.gateway_id,
            tx_packet,
            tx_max_duration_ms,
            tx_max_retries: raw.tx_max_retries,
            image_dir_url: raw.image_dir_url,
            upgrade_bootloader: raw.upgrade_bl_sd,
            bridge_id: raw.bridge_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalConf {
    #[serde(default, rename = "pacingPeriod")]
    pub pacer_interval_seconds: Option<u64>,
    #[serde(default)]
    pub upstream_enabled: Option<bool>,
    #[serde(default, rename = "uploadPixelsTraffic")]
    pub pixels_traffic_enabled: Option<bool>,
    #[serde(default, rename = "uploadConfigurationTraffic")]
    pub edge_traffic_enabled: Option<bool>,
    #[serde(default)]
    pub ble_logs_enabled: Option<bool>,
    #[serde(default)]
    pub version_name: Option<String>,
    #[serde(default, rename = "gwDataMode")]
    pub data_output_filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConf {
    #[serde(default)]
    pub gateway_version: Option<String>,
    #[serde(default)]
    pub additional: Option<AdditionalConf>,
}

/// Gateway settings pushed by the cloud. Each accessor falls back to the current value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationMessage {
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub gateway_type: Option<String>,
    pub gateway_conf: GatewayConf,
}

impl ConfigurationMessage {
    fn additional(&self) -> Option<&AdditionalConf> {
        self.gateway_conf.additional.as_ref()
    }

    pub fn pacing_period_ms(&self, default: u64) -> u64 {
        self.additional()
            .and_then(|a| a.pacer_interval_seconds)
            .map_or(default, |s| s.saturating_mul(1000))
    }

    pub fn upstream_enabled(&self, default: bool) -> bool {
        self.additional().and_then(|a| a.upstream_enabled).unwrap_or(default)
    }

    pub fn pixels_traffic_enabled(&self, default: bool) -> bool {
        self.additional().and_then(|a| a.pixels_traffic_enabled).unwrap_or(default)
    }

    pub fn edge_traffic_enabled(&self, default: bool) -> bool {
        self.additional().and_then(|a| a.edge_traffic_enabled).unwrap_or(default)
    }

    pub fn ble_logs_enabled(&self, default: bool) -> bool {
        self.additional().and_then(|a| a.ble_logs_enabled).unwrap_or(default)
    }

    pub fn data_output_filter(&self, default: DataOutputFilter) -> DataOutputFilter {
        self.additional()
            .and_then(|a| a.data_output_filter.as_deref())
            .and_then(DataOutputFilter::from_serial)
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkMessage {
    Action(ActionMessage),
    Configuration(ConfigurationMessage),
    CustomBroker(CustomBrokerConfig),
}

impl DownlinkMessage {
    pub fn parse(raw: &str) -> Result<Self, DownlinkError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| DownlinkError::Malformed(e.to_string()))?;
        let Some(obj) = value.as_object() else {
            return Err(DownlinkError::UnknownShape);
        };
        let invalid = |kind: &'static str| move |e: serde_json::Error| DownlinkError::Invalid {
            kind,
            reason: e.to_string(),
        };
        if obj.contains_key("action") {
            let raw: RawAction = serde_json::from_value(value).map_err(invalid("action"))?;
            Ok(Self::Action(raw.into()))
        } else if obj.contains_key("gatewayConf") {
            Ok(Self::Configuration(
                serde_json::from_value(value).map_err(invalid("configuration"))?,
            ))
        } else if obj.contains_key("customBroker") {
            Ok(Self::CustomBroker(
                serde_json::from_value(value).map_err(invalid("customBroker"))?,
            ))
        } else {
            Err(DownlinkError::UnknownShape)
        }
    }

    /// Whether the gateway acts on this message. Bridge OTA, configuration and broker
    /// changes require a cloud managed gateway.
    pub fn is_eligible(&self, cloud_managed: bool) -> bool {
        match self {
            Self::Action(a) => a.action != BridgeAction::BridgeOta || cloud_managed,
            Self::Configuration(_) | Self::CustomBroker(_) => cloud_managed,
        }
    }
}

/// True when a raw downlink carries a command for the virtual bridge with `vbridge_mac`:
/// a get-module request or a datapath configuration naming it.
pub fn is_vbridge_message(raw: &str, vbridge_mac: &str) -> bool {
    let raw = raw.to_ascii_uppercase();
    let mac = vbridge_mac.replace(':', "").to_ascii_uppercase();
    if mac.is_empty() {
        return false;
    }
    raw.contains(&format!("{}03", mac)) || (raw.contains("C6FC0000ED25") && raw.contains(&mac))
}
