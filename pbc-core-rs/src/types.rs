//! Core types for the PBC protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Zone identifier, 1-based and stable for the lifetime of the fleet
pub type ZoneId = u16;

/// Desire-to-run priority
pub type Priority = u8;

/// Priority of a zone that must not run
pub const MIN_PRIORITY: Priority = 0;

/// Priority of a zone that must run
pub const MAX_PRIORITY: Priority = 10;

/// Topic carrying liveness broadcasts
pub const TOPIC_LEADER: &str = "leader";

/// Topic carrying poll reports
pub const TOPIC_POLL: &str = "poll";

/// Prefix of the per-issuer decision topics
pub const TOPIC_STATUS_PREFIX: &str = "status/z";

/// Decision topic for a given issuer, e.g. `status/z3`
pub fn status_topic(issued_by: ZoneId) -> String {
    format!("{}{}", TOPIC_STATUS_PREFIX, issued_by)
}

/// Equipment stage. Negative stages cool, positive stages heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Mode {
    Cool2,
    Cool1,
    #[default]
    Off,
    Heat1,
    Heat2,
}

impl Mode {
    /// Signed stage value as carried on the wire
    pub fn stage(self) -> i8 {
        match self {
            Mode::Cool2 => -2,
            Mode::Cool1 => -1,
            Mode::Off => 0,
            Mode::Heat1 => 1,
            Mode::Heat2 => 2,
        }
    }

    /// Stage magnitude (0, 1 or 2)
    pub fn intensity(self) -> u8 {
        self.stage().unsigned_abs()
    }

    pub fn is_on(self) -> bool {
        self != Mode::Off
    }

    pub fn is_high_intensity(self) -> bool {
        self.intensity() == 2
    }
}

impl From<Mode> for i8 {
    fn from(mode: Mode) -> Self {
        mode.stage()
    }
}

/// Stage value outside -2..=2
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid mode stage {0}")]
pub struct InvalidMode(pub i8);

impl TryFrom<i8> for Mode {
    type Error = InvalidMode;

    fn try_from(stage: i8) -> Result<Self, Self::Error> {
        match stage {
            -2 => Ok(Mode::Cool2),
            -1 => Ok(Mode::Cool1),
            0 => Ok(Mode::Off),
            1 => Ok(Mode::Heat1),
            2 => Ok(Mode::Heat2),
            other => Err(InvalidMode(other)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Cool2 => "COOL2",
            Mode::Cool1 => "COOL1",
            Mode::Off => "OFF",
            Mode::Heat1 => "HEAT1",
            Mode::Heat2 => "HEAT2",
        };
        f.write_str(name)
    }
}

/// Per-zone equipment snapshot consumed by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentState {
    pub id: ZoneId,
    pub priority: Priority,
    pub is_on: bool,
    pub mode: Mode,
    /// Minimum dwell time since the last mode change has elapsed
    pub can_switch: bool,
}

impl EquipmentState {
    /// Conservative stand-in for a zone with no fresh report: never
    /// scheduled, never shut down.
    pub fn placeholder(id: ZoneId) -> Self {
        Self {
            id,
            priority: MIN_PRIORITY,
            is_on: false,
            mode: Mode::Off,
            can_switch: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        *self == Self::placeholder(self.id)
    }
}

/// Scheduling verdict for one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Activate,
    Shutdown,
    NoChange,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Activate => f.write_str("activate"),
            Action::Shutdown => f.write_str("shutdown"),
            Action::NoChange => f.write_str("no_change"),
        }
    }
}

/// Decision issued by the leader for one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub target: ZoneId,
    pub action: Action,
    pub issued_by: ZoneId,
    pub issued_at: DateTime<Utc>,
}

/// PBC protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Liveness broadcast
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { sender: ZoneId },

    /// Periodic equipment report
    #[serde(rename = "POLL")]
    Poll(EquipmentState),

    /// Scheduling decision from the leader
    #[serde(rename = "DECISION")]
    Decision(ScheduleDecision),
}

impl Message {
    /// Topic the message is published on
    pub fn topic(&self) -> String {
        match self {
            Message::Heartbeat { .. } => TOPIC_LEADER.to_string(),
            Message::Poll(_) => TOPIC_POLL.to_string(),
            Message::Decision(decision) => status_topic(decision.issued_by),
        }
    }
}

/// Message plus routing header, one per wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    /// Sender zone for heartbeats and polls, target zone for decisions
    pub zone: ZoneId,
    pub message: Message,
}

impl Envelope {
    pub fn new(zone: ZoneId, message: Message) -> Self {
        Self {
            topic: message.topic(),
            zone,
            message,
        }
    }

    /// Serialize envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_stage_mapping() {
        for stage in -2i8..=2 {
            let mode = Mode::try_from(stage).unwrap();
            assert_eq!(mode.stage(), stage);
        }
        assert_eq!(Mode::try_from(3), Err(InvalidMode(3)));
        assert!(Mode::Cool2.is_high_intensity());
        assert!(!Mode::Heat1.is_high_intensity());
        assert!(!Mode::Off.is_on());
    }

    #[test]
    fn test_decision_envelope_serialization() {
        let decision = ScheduleDecision {
            target: 2,
            action: Action::Activate,
            issued_by: 1,
            issued_at: Utc::now(),
        };
        let envelope = Envelope::new(2, Message::Decision(decision.clone()));
        assert_eq!(envelope.topic, "status/z1");

        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();

        match parsed.message {
            Message::Decision(d) => assert_eq!(d, decision),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_poll_wire_format() {
        let report = EquipmentState {
            id: 3,
            priority: 7,
            is_on: true,
            mode: Mode::Cool1,
            can_switch: false,
        };
        let json = serde_json::to_value(Envelope::new(3, Message::Poll(report))).unwrap();

        assert_eq!(json["topic"], "poll");
        assert_eq!(json["message"]["type"], "POLL");
        assert_eq!(json["message"]["mode"], -1);
        assert_eq!(json["message"]["can_switch"], false);
    }

    #[test]
    fn test_invalid_mode_rejected_on_decode() {
        let raw = r#"{"topic":"poll","zone":1,"message":{"type":"POLL","id":1,"priority":0,"is_on":false,"mode":5,"can_switch":true}}"#;
        assert!(Envelope::from_bytes(raw.as_bytes()).is_err());
    }
}
