//! Stream events emitted on egress topics during a run.
//!
//! Every envelope a worker processes produces a sequence of events on
//! `stream:<conversation_id>`: zero or more `token` and `tool_step` events,
//! optional `log` diagnostics, and exactly one terminal `output` event. The
//! signal layer additionally mirrors `signal_send`/`signal_recv` visibility
//! records onto the same topic so observers can see coordination without
//! seeing payloads.
//!
//! # Wire shape
//!
//! Events are a tagged sum: compact JSON objects discriminated by an `event`
//! field (`"token"`, `"tool_step"`, `"output"`, `"log"`, `"signal_send"`,
//! `"signal_recv"`). Unknown fields are preserved across a decode/encode
//! round trip so older readers can forward events from newer writers.
//!
//! # Invariant
//!
//! For any run, the concatenation of `token` texts in `index` order equals the
//! terminal `output` text (up to terminal truncation the Runner may apply).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from stream event codec operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an event to JSON.
    #[error("Failed to serialize stream event: {0}")]
    Serialization(String),

    /// Failed to deserialize an event from JSON.
    #[error("Failed to deserialize stream event: {0}")]
    Deserialization(String),
}

/// Severity of a [`StreamEvent::Log`] record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Routine progress.
    Info,
    /// Something degraded but the run continues.
    Warning,
    /// Something failed; usually precedes an error `output`.
    Error,
}

/// A fine-grained progress event on an egress topic.
///
/// The `event` discriminator and per-variant fields are frozen wire shapes;
/// each variant carries a flattened `extra` map so fields added by newer
/// writers survive a round trip through older readers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial assistant text; `index` increases monotonically within a run.
    Token {
        /// Conversation this run belongs to.
        conversation_id: String,
        /// The partial text fragment.
        text: String,
        /// Zero-based position of this fragment within the run.
        index: u64,
        /// Forward-compatible passthrough fields.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// A tool invocation or completion; completions carry `result_summary`.
    ToolStep {
        /// Conversation this run belongs to.
        conversation_id: String,
        /// Tool name.
        name: String,
        /// Tool arguments as given to the tool.
        args: Value,
        /// Present on completion records only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_summary: Option<String>,
        /// Forward-compatible passthrough fields.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// The terminal event of a run; `text` is the full assistant reply.
    Output {
        /// Conversation this run belongs to.
        conversation_id: String,
        /// Full assistant reply.
        text: String,
        /// Token accounting from the Runner, when it reports any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
        /// Forward-compatible passthrough fields.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Diagnostic passthrough from the worker or Runner.
    Log {
        /// Conversation this run belongs to.
        conversation_id: String,
        /// Severity.
        level: LogLevel,
        /// Component that produced the record (e.g. `"worker"`).
        component: String,
        /// Human-readable message.
        message: String,
        /// Forward-compatible passthrough fields.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Visibility record: a signal was sent from this conversation.
    ///
    /// Carries topic, cursor and payload length only, never the payload.
    SignalSend {
        /// Conversation the sender was running in.
        conversation_id: String,
        /// Signal topic the payload went to.
        topic: String,
        /// Bus cursor of the signal entry, when the publish succeeded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        /// Size of the signal payload in bytes.
        payload_bytes: usize,
        /// Forward-compatible passthrough fields.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Visibility record: a signal wait completed in this conversation.
    SignalRecv {
        /// Conversation the waiter was running in.
        conversation_id: String,
        /// Signal topic the entry arrived on.
        topic: String,
        /// Bus cursor of the received entry.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        /// Size of the received payload in bytes.
        payload_bytes: usize,
        /// Forward-compatible passthrough fields.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl StreamEvent {
    /// Build a `token` event.
    #[must_use]
    pub fn token(conversation_id: impl Into<String>, text: impl Into<String>, index: u64) -> Self {
        Self::Token {
            conversation_id: conversation_id.into(),
            text: text.into(),
            index,
            extra: Map::new(),
        }
    }

    /// Build a `tool_step` event.
    #[must_use]
    pub fn tool_step(
        conversation_id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
        result_summary: Option<String>,
    ) -> Self {
        Self::ToolStep {
            conversation_id: conversation_id.into(),
            name: name.into(),
            args,
            result_summary,
            extra: Map::new(),
        }
    }

    /// Build a terminal `output` event.
    #[must_use]
    pub fn output(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Output {
            conversation_id: conversation_id.into(),
            text: text.into(),
            usage: None,
            extra: Map::new(),
        }
    }

    /// Build a `log` event.
    #[must_use]
    pub fn log(
        conversation_id: impl Into<String>,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Log {
            conversation_id: conversation_id.into(),
            level,
            component: component.into(),
            message: message.into(),
            extra: Map::new(),
        }
    }

    /// The conversation this event belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Token {
                conversation_id, ..
            }
            | Self::ToolStep {
                conversation_id, ..
            }
            | Self::Output {
                conversation_id, ..
            }
            | Self::Log {
                conversation_id, ..
            }
            | Self::SignalSend {
                conversation_id, ..
            }
            | Self::SignalRecv {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// The `event` discriminator as it appears on the wire.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolStep { .. } => "tool_step",
            Self::Output { .. } => "output",
            Self::Log { .. } => "log",
            Self::SignalSend { .. } => "signal_send",
            Self::SignalRecv { .. } => "signal_recv",
        }
    }

    /// Whether this is the terminal event of a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Output { .. })
    }

    /// Serialize to the compact JSON carried as a bus payload and SSE `data:`
    /// line.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] on encoder failure; with the
    /// closed set of field types here that indicates a non-string key smuggled
    /// into `extra`.
    pub fn to_payload(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Deserialize from a bus payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] for malformed payloads or
    /// unknown `event` discriminators. Readers treat this as a protocol
    /// error: log, skip, continue.
    pub fn from_payload(payload: &str) -> Result<Self, EventError> {
        serde_json::from_str(payload).map_err(|e| EventError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn discriminators_match_wire_names() {
        let event = StreamEvent::token("c1", "h", 0);
        let value: Value = serde_json::from_str(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["event"], "token");

        let event = StreamEvent::tool_step("c1", "search", serde_json::json!({"q": "x"}), None);
        let value: Value = serde_json::from_str(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["event"], "tool_step");

        let event = StreamEvent::output("c1", "hi");
        let value: Value = serde_json::from_str(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["event"], "output");
    }

    #[test]
    fn only_output_is_terminal() {
        assert!(StreamEvent::output("c1", "done").is_terminal());
        assert!(!StreamEvent::token("c1", "d", 0).is_terminal());
        assert!(!StreamEvent::log("c1", LogLevel::Error, "worker", "boom").is_terminal());
    }

    #[test]
    fn unknown_fields_round_trip() {
        let payload = r#"{"event":"token","conversation_id":"c1","text":"h","index":0,"trace_id":"t-9"}"#;
        let event = StreamEvent::from_payload(payload).unwrap();
        let StreamEvent::Token { ref extra, .. } = event else {
            panic!("expected token event");
        };
        assert_eq!(extra["trace_id"], "t-9");

        let reencoded = event.to_payload().unwrap();
        let value: Value = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(value["trace_id"], "t-9");
    }

    #[test]
    fn unknown_discriminator_is_a_protocol_error() {
        let payload = r#"{"event":"telemetry","conversation_id":"c1"}"#;
        assert!(StreamEvent::from_payload(payload).is_err());
    }

    #[test]
    fn tool_completion_carries_result_summary() {
        let event = StreamEvent::tool_step(
            "c1",
            "search",
            serde_json::json!({"q": "rust"}),
            Some("3 hits".to_string()),
        );
        let value: Value = serde_json::from_str(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["result_summary"], "3 hits");
    }

    #[test]
    fn log_levels_serialize_lowercase() {
        let event = StreamEvent::log("c1", LogLevel::Warning, "gateway", "behind retention");
        let value: Value = serde_json::from_str(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["level"], "warning");
    }
}
