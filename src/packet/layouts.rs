//! Field tables for every packet family the gateway reads or writes.
//!
//! Offsets are absolute bit positions from the first hex character of the payload,
//! so the 5 byte signature (`C6FC0000EE` and friends) occupies bits 0..40.

use super::fields::{field, Field, Layout};

/// Length in bits of a standard 29 byte advertisement payload.
pub const PAYLOAD_BITS: usize = 232;

pub const HEADER_BRIDGE: &str = "C6FC0000EE";
pub const HEADER_CONTROL: &str = "C6FC0000ED";

/// Heartbeat, api 5 and later. Also the layout the virtual bridge emits.
pub const HEARTBEAT: Layout = Layout {
    name: "heartbeat",
    header: HEADER_BRIDGE,
    fields: &[
        field("msg_type", 40, 8),
        field("api_version", 48, 8),
        field("seq_id", 56, 8),
        field("brg_mac", 64, 48),
        field("non_wlt_rx", 112, 24),
        field("bad_crc", 136, 24),
        field("wlt_rx", 160, 24),
        field("wlt_tx", 184, 16),
        field("tags", 200, 16),
        field("tx_queue_watermark", 216, 8),
        field("dynamic", 224, 1),
        field("effective_pacer", 225, 7),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const HEARTBEAT_V1: Layout = Layout {
    name: "heartbeat_v1",
    header: "",
    fields: &[
        field("msg_type", 40, 8),
        field("api_version", 48, 8),
        field("seq_id", 56, 8),
        field("src_mac", 112, 48),
        field("sent_pkts", 160, 16),
        field("non_wlt_pkts", 176, 16),
        field("tags", 192, 16),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const INTERFACE: Layout = Layout {
    name: "interface",
    header: HEADER_BRIDGE,
    fields: &[
        field("module_type", 40, 4),
        field("msg_type", 44, 4),
        field("api_version", 48, 8),
        field("seq_id", 56, 8),
        field("brg_mac", 64, 48),
        field("board_type", 112, 8),
        field("bl_version", 120, 8),
        field("major", 128, 8),
        field("minor", 136, 8),
        field("patch", 144, 8),
        field("cap_glob", 152, 1),
        field("cap_datapath", 153, 1),
        field("cap_energy_2400", 154, 1),
        field("cap_energy_sub1g", 155, 1),
        field("cap_calibration", 156, 1),
        field("cap_pwr_mgmt", 157, 1),
        field("cap_sensors", 158, 1),
        field("cap_custom", 159, 1),
        field("cfg_hash", 160, 32),
    ],
    total_bits: PAYLOAD_BITS,
};

const DATAPATH_FIELDS: &[Field] = &[
    field("module_type", 40, 4),
    field("msg_type", 44, 4),
    field("api_version", 48, 8),
    field("seq_id", 56, 8),
    field("brg_mac", 64, 48),
    field("global_pacing_group", 112, 4),
    field("adaptive_pacer", 118, 1),
    field("unified_echo", 119, 1),
    field("pacer_interval", 120, 16),
    field("pkt_filter", 136, 5),
    field("tx_repetition", 141, 3),
    field("comm_output_power", 144, 8),
    field("comm_pattern", 152, 4),
];

/// Datapath module configuration as announced by a bridge.
pub const DATAPATH: Layout = Layout {
    name: "datapath",
    header: HEADER_BRIDGE,
    fields: DATAPATH_FIELDS,
    total_bits: PAYLOAD_BITS,
};

/// Datapath module configuration as sent to a bridge by the cloud.
pub const DATAPATH_SET: Layout = Layout {
    name: "datapath_set",
    header: HEADER_CONTROL,
    fields: DATAPATH_FIELDS,
    total_bits: PAYLOAD_BITS,
};

/// Action request asking a bridge to report one or more modules.
pub const GET_MODULE: Layout = Layout {
    name: "get_module",
    header: HEADER_CONTROL,
    fields: &[
        field("module_type", 40, 4),
        field("msg_type", 44, 4),
        field("api_version", 48, 8),
        field("seq_id", 56, 8),
        field("brg_mac", 64, 48),
        field("action", 112, 8),
        field("want_interface", 120, 1),
        field("want_datapath", 121, 1),
    ],
    total_bits: PAYLOAD_BITS,
};

/// Trailing meta bytes 15..18 of an echo (combined SI) packet.
pub const ECHO: Layout = Layout {
    name: "echo",
    header: "",
    fields: &[
        field("prefix", 0, 16),
        field("group_id", 32, 8),
        field("nfpkt", 120, 8),
        field("rssi", 128, 6),
        field("brg_latency", 134, 6),
        field("global_pacing", 140, 4),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const META: Layout = Layout {
    name: "meta",
    header: "",
    fields: &[
        field("bridge_mac", 40, 48),
        field("filtered_count", 88, 16),
        field("rssi", 104, 8),
        field("brg_id", 112, 8),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const EXTERNAL_SENSOR: Layout = Layout {
    name: "external_sensor",
    header: "",
    fields: &[
        field("bridge_mac", 40, 48),
        field("nfpkt", 88, 16),
        field("rssi", 104, 8),
        field("global_pacing_group", 112, 4),
        field("sensor_mac", 120, 48),
        field("sensor_service_id", 168, 24),
        field("api_version", 192, 4),
        field("scrambled", 197, 1),
        field("embedded", 198, 1),
        field("sensor", 199, 1),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const CONTROL: Layout = Layout {
    name: "control",
    header: "",
    fields: &[
        field("msg_type", 40, 8),
        field("brg_id", 48, 8),
        field("seq_id", 56, 8),
        field("dest_mac", 64, 48),
        field("src_mac", 112, 48),
        field("rssi", 160, 8),
        field("cycle_time", 168, 8),
        field("tx_time", 176, 8),
        field("energy_pattern", 184, 8),
        field("output_power", 192, 8),
        field("pacer_interval", 200, 8),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const CONFIG_V5: Layout = Layout {
    name: "config_v5",
    header: "",
    fields: &[
        field("msg_type", 40, 8),
        field("api_version", 48, 8),
        field("seq_id", 56, 8),
        field("global_pacing", 64, 1),
        field("tx_probability", 65, 3),
        field("stat_freq", 68, 4),
        field("sub1g_output_power", 76, 4),
        field("sub1g_tx_time", 80, 4),
        field("sub1g_frequency", 84, 4),
        field("bl_version", 88, 8),
        field("board_type", 96, 8),
        field("src_mac", 112, 48),
        field("major", 160, 8),
        field("minor", 168, 8),
        field("patch", 176, 8),
        field("cycle_time", 184, 8),
        field("tx_time", 192, 8),
        field("energy_pattern", 200, 8),
        field("output_power", 208, 8),
        field("pacer_interval", 216, 16),
    ],
    total_bits: PAYLOAD_BITS,
};

/// Same as v5 except the board type sits where v5 carries the api version.
pub const CONFIG_V3: Layout = Layout {
    name: "config_v3",
    header: "",
    fields: &[
        field("msg_type", 40, 8),
        field("board_type", 48, 8),
        field("seq_id", 56, 8),
        field("global_pacing", 64, 1),
        field("tx_probability", 65, 3),
        field("stat_freq", 68, 4),
        field("sub1g_output_power", 76, 4),
        field("sub1g_tx_time", 80, 4),
        field("sub1g_frequency", 84, 4),
        field("bl_version", 88, 8),
        field("src_mac", 112, 48),
        field("major", 160, 8),
        field("minor", 168, 8),
        field("patch", 176, 8),
        field("cycle_time", 184, 8),
        field("tx_time", 192, 8),
        field("energy_pattern", 200, 8),
        field("output_power", 208, 8),
        field("pacer_interval", 216, 16),
    ],
    total_bits: PAYLOAD_BITS,
};

pub const CONFIG_V2: Layout = Layout {
    name: "config_v2",
    header: "",
    fields: &[
        field("msg_type", 40, 8),
        field("brg_id", 48, 8),
        field("seq_id", 56, 8),
        field("dest_mac", 64, 48),
        field("src_mac", 112, 48),
        field("major", 160, 4),
        field("minor", 164, 4),
        field("patch", 168, 4),
        field("tx_probability", 177, 6),
        field("single_band", 183, 1),
        field("cycle_time", 184, 8),
        field("tx_time", 192, 8),
        field("energy_pattern", 200, 8),
        field("output_power", 208, 8),
        field("pacer_interval", 216, 16),
    ],
    total_bits: PAYLOAD_BITS,
};

/// Module exchange ("MEL") packets share a common preamble; the body depends on the module.
pub const MODULE_EXCHANGE: Layout = Layout {
    name: "module_exchange",
    header: HEADER_BRIDGE,
    fields: &[
        field("module_type", 40, 4),
        field("msg_type", 44, 4),
        field("api_version", 48, 8),
        field("seq_id", 56, 8),
        field("brg_mac", 64, 48),
    ],
    total_bits: PAYLOAD_BITS,
};
