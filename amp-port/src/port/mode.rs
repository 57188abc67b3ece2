//! Protocol modes of a port.

use serde::{Deserialize, Serialize};

/// How whole-registry cycles talk to the boards.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::FromRepr,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ProtocolMode {
    /// One transaction per board in both directions.
    #[default]
    #[strum(to_string = "sequential")]
    Sequential = 0,
    /// Sequential reads, one broadcast write for all boards.
    #[strum(to_string = "sequential-read-broadcast-write")]
    SequentialReadBroadcastWrite = 1,
    /// Broadcast query and read, broadcast write.
    #[strum(to_string = "broadcast")]
    Broadcast = 2,
}

impl ProtocolMode {
    /// Whether every board must support broadcast for this mode.
    pub fn needs_broadcast(self) -> bool {
        !matches!(self, ProtocolMode::Sequential)
    }

    pub fn broadcast_write(self) -> bool {
        self.needs_broadcast()
    }

    pub fn broadcast_read(self) -> bool {
        matches!(self, ProtocolMode::Broadcast)
    }

    /// Confirmation logged once the mode is committed.
    pub fn description(self) -> &'static str {
        match self {
            ProtocolMode::Sequential => "System running in NON broadcast mode",
            ProtocolMode::SequentialReadBroadcastWrite => "System running with broadcast write",
            ProtocolMode::Broadcast => "System running with broadcast query, read, and write",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use test_case::test_case;

    #[test_case(0, Some(ProtocolMode::Sequential))]
    #[test_case(1, Some(ProtocolMode::SequentialReadBroadcastWrite))]
    #[test_case(2, Some(ProtocolMode::Broadcast))]
    #[test_case(3, None)]
    #[test_case(255, None)]
    fn test_from_raw(raw: u8, expected: Option<ProtocolMode>) {
        assert_eq!(ProtocolMode::from_repr(raw), expected);
    }

    #[test]
    fn test_only_sequential_is_unguarded() {
        let guarded: Vec<_> = ProtocolMode::iter().filter(|m| m.needs_broadcast()).collect();
        assert_eq!(
            guarded,
            vec![ProtocolMode::SequentialReadBroadcastWrite, ProtocolMode::Broadcast]
        );
        assert!(!ProtocolMode::SequentialReadBroadcastWrite.broadcast_read());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ProtocolMode::SequentialReadBroadcastWrite).unwrap();
        assert_eq!(json, "\"sequential-read-broadcast-write\"");
        let mode: ProtocolMode = serde_json::from_str("\"broadcast\"").unwrap();
        assert_eq!(mode, ProtocolMode::Broadcast);
    }
}
