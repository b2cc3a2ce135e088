//! Radio configuration reported by a bridge in its config packets.

use serde::{Deserialize, Serialize};

use super::{ConfigVersion, Packet, PacketKind};

/// Sub-1GHz output power, dBm, indexed by the 4-bit profile field.
const SUB1G_OUTPUT_POWER_DBM: [u32; 7] = [14, 17, 20, 23, 26, 29, 32];
const SUB1G_OUTPUT_POWER_DEFAULT: u32 = 32;

/// Sub-1GHz frequency, kHz, indexed by the 4-bit profile field.
const SUB1G_FREQUENCY_KHZ: [u32; 6] = [915_000, 865_700, 916_300, 917_500, 918_000, 919_100];
const SUB1G_FREQUENCY_DEFAULT: u32 = 915_000;

pub fn sub1g_output_power(profile: u64) -> u32 {
    usize::try_from(profile)
        .ok()
        .and_then(|i| SUB1G_OUTPUT_POWER_DBM.get(i).copied())
        .unwrap_or(SUB1G_OUTPUT_POWER_DEFAULT)
}

pub fn sub1g_frequency(profile: u64) -> u32 {
    usize::try_from(profile)
        .ok()
        .and_then(|i| SUB1G_FREQUENCY_KHZ.get(i).copied())
        .unwrap_or(SUB1G_FREQUENCY_DEFAULT)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfiguration {
    pub tx_probability: u32,
    pub energy_pattern: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_pacing_enabled: Option<bool>,
    pub tx_period_ms: u32,
    #[serde(rename = "2.4GhzOutputPower")]
    pub output_power_2_4ghz: u32,
    pub rx_tx_period_ms: u32,
    pub pacer_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub1ghz_output_power: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub1ghz_frequency: Option<u32>,
}

impl BridgeConfiguration {
    /// Decode the radio configuration of a bridge config packet.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let version = match packet.kind {
            PacketKind::BridgeConfig(v) => v,
            _ => return None,
        };
        let f = |name: &str| packet.field(name);
        let common = BridgeConfiguration {
            tx_probability: 0,
            energy_pattern: f("energy_pattern")? as u32,
            global_pacing_enabled: None,
            tx_period_ms: f("tx_time")? as u32,
            output_power_2_4ghz: f("output_power")? as u32,
            rx_tx_period_ms: f("cycle_time")? as u32,
            pacer_interval: f("pacer_interval")?,
            sub1ghz_output_power: None,
            sub1ghz_frequency: None,
        };
        Some(match version {
            ConfigVersion::V2 => BridgeConfiguration {
                tx_probability: f("tx_probability")? as u32,
                ..common
            },
            ConfigVersion::V3 | ConfigVersion::V5 => BridgeConfiguration {
                tx_probability: 30 + 10 * f("tx_probability")? as u32,
                global_pacing_enabled: Some(f("global_pacing")? == 1),
                sub1ghz_output_power: Some(sub1g_output_power(f("sub1g_output_power")?)),
                sub1ghz_frequency: Some(sub1g_frequency(f("sub1g_frequency")?)),
                ..common
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_maps_fall_back_to_defaults() {
        assert_eq!(sub1g_output_power(0), 14);
        assert_eq!(sub1g_output_power(6), 32);
        assert_eq!(sub1g_output_power(9), 32);
        assert_eq!(sub1g_frequency(1), 865_700);
        assert_eq!(sub1g_frequency(15), 915_000);
    }
}
