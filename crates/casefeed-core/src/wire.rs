use crate::event::EventKind;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const PING_FRAME: &str = "ping";
pub const PONG_FRAME: &str = "pong";

/// Event kind as it arrives on the wire: either one of the known kinds or
/// the raw string the server sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WireKind {
    Known(EventKind),
    Unrecognized(String),
}

impl WireKind {
    pub fn parse(raw: &str) -> Self {
        match EventKind::from_wire(raw) {
            Some(kind) => Self::Known(kind),
            None => Self::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(kind) => kind.as_str(),
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }
}

impl Serialize for WireKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WireKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct WireKindVisitor;

        impl<'de> Visitor<'de> for WireKindVisitor {
            type Value = WireKind;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an event type string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(WireKind::parse(value))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_str(WireKindVisitor)
    }
}

/// One inbound timeline message exactly as the server pushed it. Every
/// field is optional here; the normalizer decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WireEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<WireKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "caseId", skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, alias = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireEvent {
    /// Server identifier, preferring `id` over `event_id`. Blank values count
    /// as absent.
    pub fn server_id(&self) -> Option<&str> {
        [self.id.as_deref(), self.event_id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Pong,
    Event(WireEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame is empty")]
    Empty,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<WireFrame, WireError> {
    if text.len() > max_frame_bytes {
        return Err(WireError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(WireError::Empty);
    }
    if trimmed == PONG_FRAME {
        return Ok(WireFrame::Pong);
    }
    serde_json::from_str::<WireEvent>(trimmed)
        .map(WireFrame::Event)
        .map_err(|err| WireError::Decode(err.to_string()))
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, WireError> {
    let encoded = serde_json::to_string(value).map_err(|err| WireError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(WireError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_event_with_unknown_kind_and_extra_fields() {
        let frame = decode_frame(
            r#"{"type":"run_rolled_back","message":"undo","run_id":"run-7","latency_ms":12}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        let WireFrame::Event(event) = frame else {
            panic!("expected event frame")
        };
        assert_eq!(
            event.kind,
            Some(WireKind::Unrecognized("run_rolled_back".to_string()))
        );
        assert_eq!(event.run_id.as_deref(), Some("run-7"));
        assert!(event.data.is_none());
    }

    #[test]
    fn pong_text_is_heartbeat_not_event() {
        assert_eq!(
            decode_frame("pong\n", DEFAULT_MAX_FRAME_BYTES),
            Ok(WireFrame::Pong)
        );
    }

    #[test]
    fn rejects_non_object_and_oversized_frames() {
        assert!(matches!(
            decode_frame("[1,2,3]", DEFAULT_MAX_FRAME_BYTES),
            Err(WireError::Decode(_))
        ));
        assert!(matches!(
            decode_frame("{\"message\":", DEFAULT_MAX_FRAME_BYTES),
            Err(WireError::Decode(_))
        ));
        assert_eq!(decode_frame("   ", DEFAULT_MAX_FRAME_BYTES), Err(WireError::Empty));

        let oversized = format!("{{\"message\":\"{}\"}}", "x".repeat(2_000));
        assert!(matches!(
            decode_frame(&oversized, 1_024),
            Err(WireError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn server_id_prefers_id_and_skips_blank() {
        let event = WireEvent {
            id: Some("  ".to_string()),
            event_id: Some("evt-9".to_string()),
            ..WireEvent::default()
        };
        assert_eq!(event.server_id(), Some("evt-9"));
    }

    #[test]
    fn camel_case_correlation_keys_are_accepted() {
        let frame = decode_frame(
            r#"{"type":"case_updated","message":"m","caseId":"TW-1","runId":"r1"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        let WireFrame::Event(event) = frame else {
            panic!("expected event frame")
        };
        assert_eq!(event.case_id.as_deref(), Some("TW-1"));
        assert_eq!(event.run_id.as_deref(), Some("r1"));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let event = WireEvent {
            message: Some("x".repeat(128)),
            ..WireEvent::default()
        };
        assert!(matches!(
            encode_frame(&event, 64),
            Err(WireError::OversizedFrame { .. })
        ));
    }
}
