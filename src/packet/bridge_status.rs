//! Bridge status aggregation.
//!
//! Several packet families describe the same bridge: side info, heartbeats, module
//! exchange, config packets and early (connectable) advertisements. Each is folded into a
//! [`BridgeStatus`] keyed by the uppercase bridge id. [`BridgeStatus::merge`] applies the
//! meaningful-update rule shared by the ingestion pipeline and the bridge registry.

use serde::{Deserialize, Serialize};

use super::radio::BridgeConfiguration;
use super::{Packet, PacketKind};

/// Which packet family produced the latest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Formation {
    FromSideInfo,
    FromConfigPkt,
    FromEarlyPkt,
    FromMel,
    FromHb,
    /// Built locally, e.g. to force a re-resolve.
    Synthetic,
}

/// Timestamp carried by a status that was pruned from the registry.
pub const CLEARED_TIMESTAMP: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub id: String,
    pub packet: Option<Packet>,
    pub board_type: Option<u64>,
    pub version: Option<String>,
    pub config: Option<BridgeConfiguration>,
    pub formation: Formation,
    pub timestamp: i64,
}

impl BridgeStatus {
    pub fn synthetic(id: &str, timestamp: i64) -> Self {
        Self {
            id: id.to_ascii_uppercase(),
            packet: None,
            board_type: None,
            version: None,
            config: None,
            formation: Formation::Synthetic,
            timestamp,
        }
    }

    /// Build a status from a bridge-describing packet. Returns `None` for families that
    /// carry no bridge identity, or when the id field cannot be read.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let formation = match packet.kind {
            PacketKind::Meta => Formation::FromSideInfo,
            PacketKind::ModuleExchange => Formation::FromMel,
            PacketKind::BridgeHeartbeat(_) => Formation::FromHb,
            PacketKind::BridgeConfig(_) => Formation::FromConfigPkt,
            PacketKind::BridgeEarly => Formation::FromEarlyPkt,
            _ => return None,
        };
        let id = packet.bridge_id()?;
        let (board_type, version, config) = if formation == Formation::FromConfigPkt {
            (
                packet.board_type(),
                packet.firmware_version(),
                BridgeConfiguration::from_packet(packet),
            )
        } else {
            (None, None, None)
        };
        Some(Self {
            id,
            packet: Some(packet.clone()),
            board_type,
            version,
            config,
            formation,
            timestamp: packet.timestamp,
        })
    }

    /// Fold `newer` into `self`.
    ///
    /// The timestamp always advances to the max of both. Fields are only taken from
    /// `newer` when it is at least as recent, and only the fields it actually carries are
    /// compared. Returns true when version, board type or config changed; only then are
    /// the packet reference and provenance replaced.
    pub fn merge(&mut self, newer: &BridgeStatus) -> bool {
        if newer.id != self.id {
            return false;
        }
        self.timestamp = self.timestamp.max(newer.timestamp);
        if newer.timestamp != self.timestamp {
            return false;
        }
        let mut meaningful = false;
        if let Some(v) = &newer.version {
            if self.version.as_ref() != Some(v) {
                self.version = Some(v.clone());
                meaningful = true;
            }
        }
        if let Some(b) = newer.board_type {
            if self.board_type != Some(b) {
                self.board_type = Some(b);
                meaningful = true;
            }
        }
        if let Some(c) = &newer.config {
            if self.config.as_ref() != Some(c) {
                self.config = Some(c.clone());
                meaningful = true;
            }
        }
        if meaningful {
            self.packet = newer.packet.clone();
            self.formation = newer.formation;
        }
        meaningful
    }

    pub fn is_cleared(&self) -> bool {
        self.timestamp == CLEARED_TIMESTAMP
    }
}

/// Fold a list of statuses into at most one per id, keeping first-seen order.
pub fn fold_by_id(statuses: impl IntoIterator<Item = BridgeStatus>) -> Vec<BridgeStatus> {
    let mut out: Vec<BridgeStatus> = Vec::new();
    for mut status in statuses {
        status.id = status.id.to_ascii_uppercase();
        match out.iter_mut().find(|s| s.id == status.id) {
            Some(existing) => {
                existing.merge(&status);
            }
            None => out.push(status),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(ts: i64, version: Option<&str>) -> BridgeStatus {
        BridgeStatus {
            id: "AABBCCDDEEFF".into(),
            packet: None,
            board_type: None,
            version: version.map(str::to_string),
            config: None,
            formation: Formation::FromHb,
            timestamp: ts,
        }
    }

    #[test]
    fn older_update_is_a_no_op() {
        let mut a = status(200, Some("1.0.0"));
        let mut b = status(100, Some("2.0.0"));
        b.formation = Formation::FromConfigPkt;
        assert!(!a.merge(&b));
        assert_eq!(a.timestamp, 200);
        assert_eq!(a.version.as_deref(), Some("1.0.0"));
        assert_eq!(a.formation, Formation::FromHb);
    }

    #[test]
    fn equal_fields_advance_timestamp_only() {
        let mut a = status(100, Some("1.0.0"));
        let mut b = status(300, Some("1.0.0"));
        b.formation = Formation::FromConfigPkt;
        assert!(!a.merge(&b));
        assert_eq!(a.timestamp, 300);
        assert_eq!(a.formation, Formation::FromHb);
    }

    #[test]
    fn changed_version_is_meaningful() {
        let mut a = status(100, Some("1.0.0"));
        let mut b = status(300, Some("1.1.0"));
        b.formation = Formation::FromConfigPkt;
        assert!(a.merge(&b));
        assert_eq!(a.version.as_deref(), Some("1.1.0"));
        assert_eq!(a.formation, Formation::FromConfigPkt);
    }

    #[test]
    fn different_ids_never_merge() {
        let mut a = status(100, None);
        let mut b = status(300, Some("1.1.0"));
        b.id = "000000000000".into();
        assert!(!a.merge(&b));
        assert_eq!(a.timestamp, 100);
    }

    #[test]
    fn fold_keeps_one_per_id() {
        let mut lower = status(50, None);
        lower.id = "aabbccddeeff".into();
        let folded = fold_by_id(vec![status(100, None), lower, status(150, Some("3.0.1"))]);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].timestamp, 150);
        assert_eq!(folded[0].version.as_deref(), Some("3.0.1"));
    }
}
