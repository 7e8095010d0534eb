//! Commands received from clients.
//!
//! Clients send a JSON object whose fields are unioned by operation, or
//! the bare string [`CLOSE_SENTINEL`] to ask the server to close their
//! session. The server forwards every other decrypted payload unchanged
//! as a [`ReceivedMessage`]; the integration layer interprets it through
//! [`InboundMessage::from_value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::ids::ConnectionId;

/// Payload a client sends to ask the server to close its session.
pub const CLOSE_SENTINEL: &str = "close";

/// A decrypted text frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// The client asked for its session to be closed.
    Close,
    /// Any other payload, forwarded unchanged.
    Payload(Value),
}

impl InboundFrame {
    /// Classify a decrypted payload.
    pub fn classify(value: Value) -> Self {
        if value.as_str() == Some(CLOSE_SENTINEL) {
            Self::Close
        } else {
            Self::Payload(value)
        }
    }
}

/// A decrypted payload together with the session it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// The connection that sent the message.
    pub connection: ConnectionId,
    /// The decrypted JSON payload, exactly as the client sent it.
    pub payload: Value,
}

/// Typed view of an inbound command.
///
/// At least one field is expected to be present. Fields with the wrong
/// JSON type are ignored individually rather than rejecting the whole
/// message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct InboundMessage {
    /// Steno key names making up a stroke to inject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<Vec<String>>,
    /// A translation (or macro mapping) to inject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    /// Enable output for the duration of this message if it is off.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub forced: bool,
    /// Reset the key-down counters of the last stroke.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub zero_last_stroke_length: bool,
}

impl InboundMessage {
    /// Build a typed view of a raw payload.
    ///
    /// Returns `None` if the payload is not a JSON object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        let stroke = object
            .get("stroke")
            .and_then(Value::as_array)
            .and_then(|keys| {
                keys.iter()
                    .map(|key| key.as_str().map(str::to_owned))
                    .collect::<Option<Vec<_>>>()
            });

        let translation = object
            .get("translation")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let flag = |name: &str| object.get(name).and_then(Value::as_bool).unwrap_or(false);

        Some(Self {
            stroke,
            translation,
            forced: flag("forced"),
            zero_last_stroke_length: flag("zero_last_stroke_length"),
        })
    }

    /// Whether the message carries no command at all.
    pub const fn is_empty(&self) -> bool {
        self.stroke.is_none()
            && self.translation.is_none()
            && !self.forced
            && !self.zero_last_stroke_length
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn close_sentinel_is_classified() {
        assert_eq!(InboundFrame::classify(json!("close")), InboundFrame::Close);
    }

    #[test]
    fn other_strings_are_payloads() {
        let frame = InboundFrame::classify(json!("closed"));
        assert_eq!(frame, InboundFrame::Payload(json!("closed")));
    }

    #[test]
    fn objects_are_forwarded_unchanged() {
        let payload = json!({"stroke": ["S"], "extra": 1});
        assert_eq!(
            InboundFrame::classify(payload.clone()),
            InboundFrame::Payload(payload)
        );
    }

    #[test]
    fn parses_all_fields() {
        let message = InboundMessage::from_value(&json!({
            "stroke": ["S-", "T-"],
            "translation": "{^}",
            "forced": true,
            "zero_last_stroke_length": true,
        }))
        .unwrap();

        assert_eq!(
            message.stroke,
            Some(vec!["S-".to_owned(), "T-".to_owned()])
        );
        assert_eq!(message.translation.as_deref(), Some("{^}"));
        assert!(message.forced);
        assert!(message.zero_last_stroke_length);
        assert!(!message.is_empty());
    }

    #[test]
    fn wrongly_typed_fields_are_ignored() {
        let message = InboundMessage::from_value(&json!({
            "stroke": "S",
            "translation": 3,
            "forced": "yes",
        }))
        .unwrap();

        assert!(message.is_empty());
    }

    #[test]
    fn stroke_with_non_string_key_is_ignored() {
        let message = InboundMessage::from_value(&json!({"stroke": ["S", 1]})).unwrap();
        assert_eq!(message.stroke, None);
    }

    #[test]
    fn non_objects_have_no_typed_view() {
        assert!(InboundMessage::from_value(&json!(["S"])).is_none());
        assert!(InboundMessage::from_value(&json!(42)).is_none());
    }

    #[test]
    fn serializes_only_present_fields() {
        let message = InboundMessage {
            stroke: Some(vec!["S".to_owned()]),
            ..InboundMessage::default()
        };
        assert_eq!(serde_json::to_value(&message).unwrap(), json!({"stroke": ["S"]}));
    }
}
