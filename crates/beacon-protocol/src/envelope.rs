//! Client-facing message envelopes.
//!
//! Envelopes are the JSON messages exchanged between clients and the router.
//! The closed set of kinds the router interprets (`register`, `deregister`,
//! `ack`, `user`) is modeled as typed variants; every other `type` is an
//! opaque [`Relay`] whose payload is forwarded verbatim, never inspected.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recipient addressing: a single username or an ordered list (multicast).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    /// View the recipients as a slice, regardless of wire shape.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        match self {
            Recipients::One(name) => std::slice::from_ref(name),
            Recipients::Many(names) => names,
        }
    }

    /// Iterate recipient usernames in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.as_slice().iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.as_slice().iter().any(|name| name == username)
    }
}

impl From<&str> for Recipients {
    fn from(name: &str) -> Self {
        Recipients::One(name.to_string())
    }
}

/// An envelope the router forwards without interpretation.
///
/// Application types (`offer`, `answer`, `candidate`, `screen`, `audio`,
/// `text`, `leave`, `call_request`, ...) all take this shape; the router only
/// reads `from` and `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Application-defined message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Username of the sender.
    pub from: String,
    /// Destination username(s). A relay without a destination is dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Recipients>,
    /// Remaining payload fields, carried verbatim.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl Relay {
    /// Create a relay with an empty payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, from: impl Into<String>, to: impl Into<Recipients>) -> Self {
        Self {
            kind: kind.into(),
            from: from.into(),
            to: Some(to.into()),
            payload: serde_json::Map::new(),
        }
    }

    /// Copy of this relay narrowed to a single recipient.
    #[must_use]
    pub fn with_recipient(&self, recipient: &str) -> Relay {
        Relay {
            to: Some(Recipients::One(recipient.to_string())),
            ..self.clone()
        }
    }
}

/// A message exchanged between a client and the router.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Bind the sending connection to a username.
    Register { from: String },
    /// Release the sender's registration.
    Deregister { from: String },
    /// Server acknowledgment of a registration attempt.
    Ack { success: bool, username: String },
    /// Presence transition, broadcast to interested clients.
    User { connected: bool, username: String },
    /// Opaque application payload, relayed verbatim.
    Relay(Relay),
}

impl Envelope {
    /// Build a registration acknowledgment.
    #[must_use]
    pub fn ack(success: bool, username: impl Into<String>) -> Self {
        Envelope::Ack {
            success,
            username: username.into(),
        }
    }

    /// Build a presence event.
    #[must_use]
    pub fn user(connected: bool, username: impl Into<String>) -> Self {
        Envelope::User {
            connected,
            username: username.into(),
        }
    }

    /// The wire `type` of this envelope.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::Deregister { .. } => "deregister",
            Envelope::Ack { .. } => "ack",
            Envelope::User { .. } => "user",
            Envelope::Relay(relay) => &relay.kind,
        }
    }

    /// Destination usernames, if this envelope carries any.
    #[must_use]
    pub fn recipients(&self) -> Option<&Recipients> {
        match self {
            Envelope::Relay(relay) => relay.to.as_ref(),
            _ => None,
        }
    }

    /// Parse an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a JSON object with a string
    /// `type` field, or if a recognized kind is missing required fields.
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Encode this envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Relay> for Envelope {
    fn from(relay: Relay) -> Self {
        Envelope::Relay(relay)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Envelope::Register { from } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "register")?;
                map.serialize_entry("from", from)?;
                map.end()
            }
            Envelope::Deregister { from } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "deregister")?;
                map.serialize_entry("from", from)?;
                map.end()
            }
            Envelope::Ack { success, username } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("type", "ack")?;
                map.serialize_entry("success", success)?;
                map.serialize_entry("username", username)?;
                map.end()
            }
            Envelope::User {
                connected,
                username,
            } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("type", "user")?;
                map.serialize_entry("connected", connected)?;
                map.serialize_entry("username", username)?;
                map.end()
            }
            Envelope::Relay(relay) => relay.serialize(serializer),
        }
    }
}

fn str_field<E: de::Error>(value: &Value, name: &'static str) -> Result<String, E> {
    value
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| E::custom(format!("envelope is missing a string `{name}` field")))
}

fn bool_field<E: de::Error>(value: &Value, name: &'static str) -> Result<bool, E> {
    value
        .get(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| E::custom(format!("envelope is missing a boolean `{name}` field")))
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| de::Error::custom("envelope is missing a string `type` field"))?;

        match kind.as_str() {
            "register" => Ok(Envelope::Register {
                from: str_field(&value, "from")?,
            }),
            "deregister" => Ok(Envelope::Deregister {
                from: str_field(&value, "from")?,
            }),
            "ack" => Ok(Envelope::Ack {
                success: bool_field(&value, "success")?,
                username: str_field(&value, "username")?,
            }),
            "user" => Ok(Envelope::User {
                connected: bool_field(&value, "connected")?,
                username: str_field(&value, "username")?,
            }),
            _ => Relay::deserialize(value)
                .map(Envelope::Relay)
                .map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let envelope = Envelope::from_json(r#"{"type":"register","from":"alice"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::Register {
                from: "alice".to_string()
            }
        );

        let encoded: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(encoded, json!({"type": "register", "from": "alice"}));
    }

    #[test]
    fn test_ack_wire_shape() {
        let encoded = Envelope::ack(false, "carol").to_json().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"type": "ack", "success": false, "username": "carol"})
        );
    }

    #[test]
    fn test_user_event_roundtrip() {
        let envelope = Envelope::user(true, "alice");
        let decoded = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_relay_preserves_unknown_fields() {
        let raw = r#"{"type":"offer","from":"alice","to":"bob","sdp":{"kind":"offer","body":"v=0"}}"#;
        let envelope = Envelope::from_json(raw).unwrap();

        let Envelope::Relay(relay) = &envelope else {
            panic!("expected a relay");
        };
        assert_eq!(relay.kind, "offer");
        assert_eq!(relay.from, "alice");
        assert_eq!(relay.to, Some(Recipients::One("bob".to_string())));
        assert_eq!(relay.payload["sdp"]["body"], "v=0");

        // Payload fields survive re-encoding untouched.
        let reencoded: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        let original: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn test_relay_multicast_recipients() {
        let raw = r#"{"type":"text","from":"alice","to":["bob","carol"],"body":"hi"}"#;
        let envelope = Envelope::from_json(raw).unwrap();

        let recipients = envelope.recipients().unwrap();
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains("bob"));
        assert!(recipients.contains("carol"));
        assert_eq!(
            recipients.iter().collect::<Vec<_>>(),
            vec!["bob", "carol"]
        );
    }

    #[test]
    fn test_relay_narrowing() {
        let raw = r#"{"type":"text","from":"alice","to":["bob","carol"],"body":"hi"}"#;
        let Envelope::Relay(relay) = Envelope::from_json(raw).unwrap() else {
            panic!("expected a relay");
        };

        let narrowed = relay.with_recipient("carol");
        assert_eq!(narrowed.to, Some(Recipients::One("carol".to_string())));
        assert_eq!(narrowed.payload, relay.payload);

        // Narrowing a single-recipient relay to its own recipient is identity.
        let single = relay.with_recipient("bob").with_recipient("bob");
        assert_eq!(single, relay.with_recipient("bob"));
    }

    #[test]
    fn test_relay_without_destination() {
        let envelope = Envelope::from_json(r#"{"type":"leave","from":"alice"}"#).unwrap();
        assert!(envelope.recipients().is_none());
        assert_eq!(envelope.kind(), "leave");
    }

    #[test]
    fn test_missing_type_rejected() {
        assert!(Envelope::from_json(r#"{"from":"alice"}"#).is_err());
        assert!(Envelope::from_json(r#"{"type":7,"from":"alice"}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn test_register_requires_from() {
        assert!(Envelope::from_json(r#"{"type":"register"}"#).is_err());
    }
}
