//! Envelope type and addressing for messages on the bus.
//!
//! An [`Envelope`] is the immutable unit published to inbound topics. It is
//! created once at ingress (or by the orchestration helper) and never mutated;
//! workers read it, run it, and acknowledge the bus entry that carried it.
//!
//! # Addressing
//!
//! Senders and recipients are short `scheme:value` strings:
//!
//! - sender: `user:<id>` or `agent:<name>`
//! - recipient: `chat:<conversation_id>` or `agent:<name>`
//!
//! Parsing is strict: unknown schemes are validation errors and produce no
//! bus traffic.
//!
//! # Example
//!
//! ```
//! use agent_mesh_core::envelope::{Envelope, Recipient, Sender};
//!
//! let envelope = Envelope::new(
//!     "c1",
//!     Sender::User("u1".to_string()),
//!     Recipient::Agent("planner".to_string()),
//!     Some("summarize the repo".to_string()),
//! );
//!
//! assert_eq!(envelope.conversation_id, "c1");
//! assert_eq!(envelope.recipient.to_string(), "agent:planner");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors from envelope construction and codec operations.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// An address string did not match any known scheme.
    #[error("Invalid address '{address}': expected {expected}")]
    InvalidAddress {
        /// The offending address string.
        address: String,
        /// The schemes that would have been accepted.
        expected: &'static str,
    },

    /// Failed to serialize an envelope to JSON.
    #[error("Failed to serialize envelope: {0}")]
    Serialization(String),

    /// Failed to deserialize an envelope from JSON.
    #[error("Failed to deserialize envelope: {0}")]
    Deserialization(String),
}

/// The message kind discriminator.
///
/// `control` envelopes are reserved for lifecycle coordination; the core
/// publishes them like any other envelope but workers act only on `message`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A conversational message for the Runner.
    Message,
    /// A lifecycle/control record (pause/resume and similar).
    Control,
}

/// The originator of an envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Sender {
    /// A human or external client: `user:<id>`.
    User(String),
    /// Another agent: `agent:<name>`.
    Agent(String),
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Agent(name) => write!(f, "agent:{name}"),
        }
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        sender.to_string()
    }
}

impl TryFrom<String> for Sender {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if let Some(id) = value.strip_prefix("user:") {
            if !id.is_empty() {
                return Ok(Self::User(id.to_string()));
            }
        }
        if let Some(name) = value.strip_prefix("agent:") {
            if !name.is_empty() {
                return Ok(Self::Agent(name.to_string()));
            }
        }
        Err(EnvelopeError::InvalidAddress {
            address: value,
            expected: "user:<id> or agent:<name>",
        })
    }
}

/// The destination of an envelope.
///
/// `agent:` recipients fan out to both the agent's inbound topic and the
/// conversation topic at ingress; `chat:` recipients go to the conversation
/// topic only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    /// A conversation: `chat:<conversation_id>`.
    Chat(String),
    /// A named agent: `agent:<name>`.
    Agent(String),
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Agent(name) => write!(f, "agent:{name}"),
        }
    }
}

impl From<Recipient> for String {
    fn from(recipient: Recipient) -> Self {
        recipient.to_string()
    }
}

impl TryFrom<String> for Recipient {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if let Some(id) = value.strip_prefix("chat:") {
            if !id.is_empty() {
                return Ok(Self::Chat(id.to_string()));
            }
        }
        if let Some(name) = value.strip_prefix("agent:") {
            if !name.is_empty() {
                return Ok(Self::Agent(name.to_string()));
            }
        }
        Err(EnvelopeError::InvalidAddress {
            address: value,
            expected: "chat:<conversation_id> or agent:<name>",
        })
    }
}

/// Metadata key under which orchestration hints travel.
pub const ORCHESTRATE_METADATA_KEY: &str = "orchestrate";

/// Orchestration hints carried in `metadata.orchestrate`.
///
/// Written by the orchestration helper on child envelopes; read by the worker
/// after the run's terminal event to emit the completion signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrateHints {
    /// Conversation id of the parent that initiated the fan-out.
    pub parent_id: String,
    /// Signal topic to notify when this child's run completes.
    pub done_topic: String,
    /// Free-form responsibility description for this child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsibilities: Option<String>,
    /// Paths this child is allowed to touch, when the caller scopes work.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<String>,
}

/// The immutable wire record for a message addressed to a conversation or
/// an agent.
///
/// Envelopes are created at ingress and never mutated. The `id` is stable for
/// the envelope's whole life and doubles as the idempotency key on bus
/// entries; `conversation_id` is the sole routing key for egress and session
/// state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Process-generated unique identifier, stable across the envelope's life.
    pub id: Uuid,
    /// Routing key for the egress topic and session state.
    pub conversation_id: String,
    /// Who sent this envelope.
    pub sender: Sender,
    /// Where this envelope is addressed.
    pub recipient: Recipient,
    /// Message kind discriminator.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Optional text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Free-form metadata; may carry orchestration hints.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// UTC creation timestamp, RFC3339 on the wire.
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Create a new `message` envelope with a fresh id and timestamp.
    #[must_use]
    pub fn new(
        conversation_id: impl Into<String>,
        sender: Sender,
        recipient: Recipient,
        content: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            sender,
            recipient,
            kind: EnvelopeKind::Message,
            content,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace the generated id (clients may supply their own).
    #[must_use]
    pub const fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Orchestration hints, when `metadata.orchestrate` is present and well
    /// formed.
    #[must_use]
    pub fn orchestrate_hints(&self) -> Option<OrchestrateHints> {
        self.metadata
            .get(ORCHESTRATE_METADATA_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Serialize to the compact JSON carried as a bus payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the envelope cannot be
    /// encoded, which only happens for non-string metadata keys injected via
    /// raw `Value` manipulation.
    pub fn to_payload(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    /// Deserialize from a bus payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Deserialization`] if the payload is not a
    /// well-formed envelope. Subscribers treat this as a protocol error:
    /// log, skip, continue.
    pub fn from_payload(payload: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(payload).map_err(|e| EnvelopeError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new(
            "c1",
            Sender::User("u1".to_string()),
            Recipient::Agent("planner".to_string()),
            Some("hi".to_string()),
        )
    }

    #[test]
    fn sender_parses_known_schemes() {
        assert_eq!(
            Sender::try_from("user:u1".to_string()).unwrap(),
            Sender::User("u1".to_string())
        );
        assert_eq!(
            Sender::try_from("agent:planner".to_string()).unwrap(),
            Sender::Agent("planner".to_string())
        );
    }

    #[test]
    fn sender_rejects_unknown_scheme_and_empty_value() {
        assert!(Sender::try_from("bot:x".to_string()).is_err());
        assert!(Sender::try_from("user:".to_string()).is_err());
        assert!(Sender::try_from("planner".to_string()).is_err());
    }

    #[test]
    fn recipient_round_trips_through_display() {
        let recipient = Recipient::Chat("c42".to_string());
        let parsed = Recipient::try_from(recipient.to_string()).unwrap();
        assert_eq!(parsed, recipient);
    }

    #[test]
    fn payload_round_trip_preserves_fields() {
        let original = envelope();
        let payload = original.to_payload().unwrap();
        let decoded = Envelope::from_payload(&payload).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn created_at_is_rfc3339_on_the_wire() {
        let payload = envelope().to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let created_at = value["created_at"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());
    }

    #[test]
    fn kind_serializes_as_lowercase_type_field() {
        let payload = envelope().to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "message");
    }

    #[test]
    fn unknown_type_discriminator_is_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_str(&envelope().to_payload().unwrap()).unwrap();
        value["type"] = serde_json::json!("broadcast");
        assert!(Envelope::from_payload(&value.to_string()).is_err());
    }

    #[test]
    fn orchestrate_hints_round_trip_through_metadata() {
        let hints = OrchestrateHints {
            parent_id: "parent-1".to_string(),
            done_topic: "signal:orchestrate/parent-1/0/done".to_string(),
            responsibilities: Some("tests".to_string()),
            allowed_paths: vec!["src/".to_string()],
        };
        let mut metadata = Map::new();
        metadata.insert(
            ORCHESTRATE_METADATA_KEY.to_string(),
            serde_json::to_value(&hints).unwrap(),
        );
        let envelope = envelope().with_metadata(metadata);
        assert_eq!(envelope.orchestrate_hints(), Some(hints));
    }

    #[test]
    fn missing_hints_yield_none() {
        assert_eq!(envelope().orchestrate_hints(), None);
    }
}
