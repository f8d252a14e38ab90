//! Message envelope and recipient model.
//!
//! A [`Message`] is the unit carried across every transport. Event-bus
//! traffic uses messages whose `type` equals the originating event name
//! (built with [`Message::event`]); transport adapters add the wire
//! attributes before a network hop.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata attribute carrying the publishing endpoint id.
pub const ATTR_SENDER: &str = "sender";

/// Metadata attribute carrying the encoded recipient list.
pub const ATTR_RECIPIENTS: &str = "recipients";

/// Type assigned to inbound payloads that are not bus envelopes.
pub const RAW_MESSAGE_TYPE: &str = "transport.raw";

/// Generic message envelope.
///
/// Immutable once constructed, except for metadata additions made by
/// transport adapters (`sender`, `recipients`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque unique id.
    pub id: String,
    /// Channel the message was published on.
    pub channel: String,
    /// Message type; equals the channel name for event messages.
    #[serde(rename = "type")]
    pub kind: String,
    /// Serializable payload.
    pub payload: Value,
    /// Ordered string attributes, including the wire attributes.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
}

impl Message {
    pub fn new(channel: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            kind: kind.into(),
            payload,
            metadata: BTreeMap::new(),
            created: Utc::now(),
        }
    }

    /// Build an event message: type equals the originating event name.
    pub fn event(channel: impl Into<String>, payload: Value) -> Self {
        let channel = channel.into();
        Self::new(channel.clone(), channel, payload)
    }

    /// Wrap a payload the transport could not decode as a bus envelope.
    pub fn raw(channel: impl Into<String>, payload: Value) -> Self {
        Self::new(channel, RAW_MESSAGE_TYPE, payload)
    }

    /// Publishing endpoint id, if the message crossed a transport.
    pub fn sender(&self) -> Option<&str> {
        self.metadata.get(ATTR_SENDER).map(String::as_str)
    }

    /// Encoded recipient list, if the message was addressed.
    pub fn recipients(&self) -> Option<&str> {
        self.metadata.get(ATTR_RECIPIENTS).map(String::as_str)
    }

    /// Address this message to specific recipients.
    ///
    /// An empty slice clears the addressing, restoring broadcast delivery.
    pub fn address(&mut self, recipients: &[Recipient]) {
        if recipients.is_empty() {
            self.metadata.remove(ATTR_RECIPIENTS);
        } else {
            let encoded =
                crate::channel::encode_recipients(recipients.iter().map(|r| r.value.as_str()));
            self.metadata.insert(ATTR_RECIPIENTS.to_string(), encoded);
        }
    }
}

/// Kind of addressee a recipient entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    Session,
    User,
    Group,
}

/// One entry of a remote event's recipient filter.
///
/// An empty recipient list means "all endpoints".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "type")]
    pub kind: RecipientType,
    pub value: String,
}

impl Recipient {
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            kind: RecipientType::Session,
            value: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: RecipientType::User,
            value: id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            kind: RecipientType::Group,
            value: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_message_type_equals_channel() {
        let message = Message::event("DESKTOP.LOCK", json!({"reason": "idle"}));
        assert_eq!(message.channel, "DESKTOP.LOCK");
        assert_eq!(message.kind, "DESKTOP.LOCK");
        assert!(message.metadata.is_empty());
    }

    #[test]
    fn test_unique_ids() {
        let a = Message::event("DESKTOP", json!(null));
        let b = Message::event("DESKTOP", json!(null));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_wire_type_attribute_name() {
        let message = Message::event("DESKTOP", json!(1));
        let wire = serde_json::to_value(&message).unwrap();
        // The wire attribute is named "type", not "kind".
        assert_eq!(wire["type"], json!("DESKTOP"));
        assert!(wire.get("kind").is_none());
    }

    #[test]
    fn test_round_trip() {
        let mut message = Message::event("DESKTOP", json!({"n": 7}));
        message
            .metadata
            .insert(ATTR_SENDER.to_string(), "s1".to_string());

        let bytes = serde_json::to_vec(&message).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.sender(), Some("s1"));
    }

    #[test]
    fn test_raw_message_type() {
        let message = Message::raw("DESKTOP", json!("garbage"));
        assert_eq!(message.kind, RAW_MESSAGE_TYPE);
    }
}
