//! The wire-visible data model: stream kinds, screen positions, and the
//! `ProtocolMessage` envelope that every frame carries (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stable integer tags identifying a stream's purpose. The numbers are
/// wire-visible and must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StreamKind {
    /// Mandatory handshake/heartbeat/control channel.
    Command,
    Mouse,
    Keyboard,
    Clipboard,
    File,
}

impl StreamKind {
    /// All kinds beyond the mandatory `Command` stream that a client may
    /// request during handshake.
    pub const NEGOTIABLE: [StreamKind; 4] = [
        StreamKind::Mouse,
        StreamKind::Keyboard,
        StreamKind::Clipboard,
        StreamKind::File,
    ];

    const fn wire_tag(self) -> u8 {
        match self {
            Self::Command => 0,
            Self::Mouse => 1,
            Self::Keyboard => 4,
            Self::Clipboard => 12,
            Self::File => 16,
        }
    }

    fn from_wire_tag(tag: u8) -> Result<Self, String> {
        match tag {
            0 => Ok(Self::Command),
            1 => Ok(Self::Mouse),
            4 => Ok(Self::Keyboard),
            12 => Ok(Self::Clipboard),
            16 => Ok(Self::File),
            other => Err(format!("unknown StreamKind wire tag {other}")),
        }
    }
}

impl From<StreamKind> for u8 {
    fn from(kind: StreamKind) -> Self {
        kind.wire_tag()
    }
}

impl TryFrom<u8> for StreamKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_wire_tag(value)
    }
}

/// The server is always `Center`; each connected client occupies at most
/// one non-center position (uniqueness invariant, spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenPosition {
    Center,
    Top,
    Bottom,
    Left,
    Right,
    Unknown,
    None,
}

impl ScreenPosition {
    /// Whether this position can be held by at most one client at a time.
    pub fn is_unique_slot(self) -> bool {
        !matches!(self, Self::Center | Self::None)
    }
}

/// The unit of communication on the wire (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub message_type: String,
    pub timestamp: f64,
    pub sequence_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub is_chunk: bool,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub total_chunks: u32,
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
}

impl ProtocolMessage {
    /// Build a message with the bookkeeping fields defaulted (not a chunk,
    /// sequence/timestamp filled in by the caller, which owns sequencing).
    pub fn new(message_type: impl Into<String>, source: impl Into<String>, sequence_id: u64, timestamp: f64) -> Self {
        Self {
            message_type: message_type.into(),
            timestamp,
            sequence_id,
            message_id: None,
            is_chunk: false,
            chunk_index: 0,
            total_chunks: 0,
            source: source.into(),
            target: String::new(),
            payload: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Whether this message is the reserved liveness ping, discarded by the
    /// receive loop without dispatch (§4.2).
    pub fn is_heartbeat(&self) -> bool {
        self.message_type == "heartbeat"
    }
}

/// Monotonic per-sender sequence id generator. One instance per
/// `MessageExchange`/sender identity; never reset across reconnects within
/// a process lifetime (§3 invariant: "strictly increasing per sender").
#[derive(Debug, Default)]
pub struct SequenceCounter(std::sync::atomic::AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_kind_wire_tags_match_spec() {
        assert_eq!(u8::from(StreamKind::Command), 0);
        assert_eq!(u8::from(StreamKind::Mouse), 1);
        assert_eq!(u8::from(StreamKind::Keyboard), 4);
        assert_eq!(u8::from(StreamKind::Clipboard), 12);
        assert_eq!(u8::from(StreamKind::File), 16);
    }

    #[test]
    fn stream_kind_roundtrips_through_serde() {
        for kind in [
            StreamKind::Command,
            StreamKind::Mouse,
            StreamKind::Keyboard,
            StreamKind::Clipboard,
            StreamKind::File,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: StreamKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn unknown_wire_tag_rejected() {
        let err = StreamKind::try_from(99u8);
        assert!(err.is_err());
    }

    #[test]
    fn screen_position_uniqueness_predicate() {
        assert!(!ScreenPosition::Center.is_unique_slot());
        assert!(!ScreenPosition::None.is_unique_slot());
        assert!(ScreenPosition::Top.is_unique_slot());
        assert!(ScreenPosition::Left.is_unique_slot());
    }

    #[test]
    fn sequence_counter_strictly_increasing() {
        let counter = SequenceCounter::new();
        let a = counter.next();
        let b = counter.next();
        let c = counter.next();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn protocol_message_roundtrips() {
        let mut payload = HashMap::new();
        payload.insert("x".to_string(), serde_json::json!(0.5));
        let msg = ProtocolMessage::new("mouse", "server", 1, 123.456).with_payload(payload);

        let json = serde_json::to_string(&msg).unwrap();
        let back: ProtocolMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_type, "mouse");
        assert_eq!(back.source, "server");
        assert_eq!(back.payload.get("x"), Some(&serde_json::json!(0.5)));
    }

    #[test]
    fn unknown_fields_ignored_on_receive() {
        let json = r#"{"message_type":"mouse","timestamp":1.0,"sequence_id":1,"source":"server","target":"","payload":{},"future_field":42}"#;
        let msg: ProtocolMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_type, "mouse");
    }
}
