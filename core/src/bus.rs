//! Bus abstraction for append-only, cursor-addressed topics.
//!
//! The [`Bus`] trait is the seam between the runtime and its transport. Two
//! implementations share it: the in-process [`MemoryBus`](crate::MemoryBus)
//! (single-process mode and tests) and the Redis Streams bus in
//! `agent-mesh-redis` (production). Topic naming is uniform across backends
//! (see [`topic`](crate::topic)).
//!
//! # Delivery model
//!
//! - **Append-only**: entries are never mutated; each append yields a
//!   [`Cursor`] that is monotone and total-ordered within its topic.
//! - **At-least-once**: in consumer-group mode each entry goes to at most one
//!   live consumer and must be acknowledged; unacknowledged entries become
//!   eligible for redelivery after a claim timeout. Consumers must be
//!   idempotent; the canonical `id` on every entry makes duplicates
//!   recognizable.
//! - **Tail fan-out**: reads outside a group deliver the same entries to every
//!   reader.
//!
//! # Cursor opacity
//!
//! Cursors are opaque strings. Different backends use different schemes
//! (sequence numbers, `<ms>-<seq>` stream ids); callers never parse them and
//! compare them only through [`Bus::compare`].
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_mesh_core::bus::{Bus, BusMessage};
//!
//! async fn example(bus: &dyn Bus) -> Result<(), agent_mesh_core::bus::BusError> {
//!     let cursor = bus.publish("chat:c1", &BusMessage::new("{}".to_string())).await?;
//!     let entries = bus.read("chat:c1", Some(&cursor), 10, None).await?;
//!     assert!(entries.is_empty()); // strictly after our own entry
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from bus operations.
///
/// Empty reads are never errors; they return an empty batch.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// The transport failed (connection refused, timed out, broker down).
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// A caller-supplied cursor is malformed for this backend.
    #[error("Invalid cursor '{cursor}' for topic '{topic}'")]
    InvalidCursor {
        /// The topic the read targeted.
        topic: String,
        /// The cursor string that failed to resolve.
        cursor: String,
    },
}

/// Opaque, totally-ordered handle for an entry within one topic.
///
/// Only the bus that issued a cursor can order it; see [`Bus::compare`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a backend-issued cursor string.
    #[must_use]
    pub const fn new(raw: String) -> Self {
        Self(raw)
    }

    /// The raw cursor string, e.g. for an SSE `id:` line.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Cursor {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Cursor {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// The unit appended to a topic.
///
/// `payload` is the JSON-encoded envelope or stream event; `id` is the
/// canonical UUID stored alongside it so readers can de-duplicate
/// redeliveries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Canonical idempotency key for this entry.
    pub id: Uuid,
    /// JSON-encoded envelope or stream event.
    pub payload: String,
}

impl BusMessage {
    /// Create a message with a fresh canonical id.
    #[must_use]
    pub fn new(payload: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }

    /// Create a message with a caller-supplied canonical id.
    #[must_use]
    pub const fn with_id(id: Uuid, payload: String) -> Self {
        Self { id, payload }
    }
}

/// A message read back from a topic, tagged with its backend-assigned cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusEntry {
    /// Position of this entry within its topic.
    pub cursor: Cursor,
    /// The appended message.
    pub message: BusMessage,
}

/// Typed, at-least-once, ordered, cursor-addressable publish/read for named
/// topics.
///
/// Consumer-group identity (group name + consumer name) is supplied at bus
/// construction; a bus built without one reads in tail mode and treats
/// [`Bus::ack`] as a no-op.
///
/// # Dyn Compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
/// the bus can be held as `Arc<dyn Bus>` across the worker, gateway and
/// signal layers.
pub trait Bus: Send + Sync {
    /// Append a message to a topic and return the new entry's cursor.
    ///
    /// The bus does not retry internally; transient transport errors fail
    /// fast so the caller's backoff policy stays in charge.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] on transport failure.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, BusError>> + Send + 'a>>;

    /// Read up to `limit` entries strictly after `last_cursor`.
    ///
    /// With `last_cursor` absent, tail mode starts from the end of the topic
    /// (only new entries) and group mode delivers the group's next
    /// undelivered entries. If `block` is set and nothing is available, the
    /// read suspends up to that long before returning an empty batch. Empty
    /// reads are not errors.
    ///
    /// In consumer-group mode, delivered entries must subsequently be
    /// [`ack`](Bus::ack)ed; entries unacknowledged past the backend's claim
    /// timeout are redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] on transport failure and
    /// [`BusError::InvalidCursor`] when `last_cursor` is malformed.
    fn read<'a>(
        &'a self,
        topic: &'a str,
        last_cursor: Option<&'a Cursor>,
        limit: usize,
        block: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BusEntry>, BusError>> + Send + 'a>>;

    /// Mark an entry processed in consumer-group mode; no-op outside groups.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] on transport failure.
    fn ack<'a>(
        &'a self,
        topic: &'a str,
        cursor: &'a Cursor,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>>;

    /// Lightweight liveness probe backing readiness checks.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] when the transport does not respond.
    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Cursor of the oldest entry still retained on a topic, or `None` when
    /// the topic is empty.
    ///
    /// Lets readers detect a resume cursor that has fallen behind retention
    /// without parsing cursors themselves.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] on transport failure.
    fn earliest<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>, BusError>> + Send + 'a>>;

    /// Cursor of the newest entry on a topic, or the backend's floor cursor
    /// when the topic is empty.
    ///
    /// Reading strictly after the returned cursor yields exactly the entries
    /// published after this call: the anchor a tailing consumer captures
    /// once so nothing slips between its polls.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] on transport failure.
    fn latest<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, BusError>> + Send + 'a>>;

    /// The cursor before every possible entry on any topic.
    ///
    /// Reading strictly after the floor yields a topic's full retained
    /// history; [`latest`](Bus::latest) returns it for empty topics. The
    /// floor is never the cursor of a real entry.
    fn floor(&self) -> Cursor;

    /// The bus's total ordering relation over its own cursors.
    ///
    /// Only meaningful for cursors issued by (or addressed to) the same
    /// backend; callers use this instead of parsing cursor strings.
    fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering;
}

/// Consumer-group identity, fixed at bus construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupIdentity {
    /// Stable group name; one group per agent name.
    pub group: String,
    /// Unique consumer name; one per process.
    pub consumer: String,
}

impl GroupIdentity {
    /// Create a group identity.
    #[must_use]
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cursor_serializes_transparently() {
        let cursor = Cursor::from("1718000000-0");
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(json, "\"1718000000-0\"");
    }

    #[test]
    fn bus_message_new_generates_distinct_ids() {
        let a = BusMessage::new("{}".to_string());
        let b = BusMessage::new("{}".to_string());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn bus_message_with_id_is_stable() {
        let id = Uuid::new_v4();
        let message = BusMessage::with_id(id, "{}".to_string());
        assert_eq!(message.id, id);
    }
}
