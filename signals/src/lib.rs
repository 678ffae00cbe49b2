//! Signal coordination for Agent Mesh.
//!
//! Signals are named, cursor-addressed coordination channels carried on the
//! bus as `signal:<scope>/<event>` topics. They inherit the bus's guarantees
//! (at-least-once, per-topic ordered) and add policy (topic allowlist,
//! payload cap, redaction) and observability (visibility events on the
//! caller's conversation stream).
//!
//! # Waiting
//!
//! [`Signals::wait`] resolves the first entry strictly after a cursor, or a
//! structured timeout outcome; timeouts are results, not errors. The
//! multi-topic variants short-poll every topic against a shared deadline:
//! [`Signals::wait_any`] resolves on the first entry anywhere and reports
//! which topic fired; [`Signals::wait_all`] resolves once every topic has
//! fired.
//!
//! Consumers that need idempotency de-duplicate by `message_id`, the
//! canonical id of the underlying bus entry.
//!
//! # Example
//!
//! ```
//! use agent_mesh_core::MemoryBus;
//! use agent_mesh_signals::Signals;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), agent_mesh_signals::SignalError> {
//! let bus = Arc::new(MemoryBus::new());
//! let signals = Signals::new(bus);
//!
//! let sent = signals
//!     .send("signal:teamA/done", serde_json::json!({"result": "ok"}), None)
//!     .await?;
//! assert!(sent.ok);
//!
//! // A waiter anchored before the send would have seen it; this one starts
//! // at the live tail and times out.
//! let outcome = signals
//!     .wait("signal:teamA/done", None, Duration::from_millis(50), None)
//!     .await?;
//! assert!(!outcome.ok);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod orchestrate;
pub mod policy;

pub use orchestrate::{ChildHandle, Orchestrator, SplitOutcome, SplitRequest};
pub use policy::{SignalError, SignalPolicy};

use agent_mesh_core::bus::{Bus, BusEntry, BusMessage, Cursor};
use agent_mesh_core::event::StreamEvent;
use agent_mesh_core::topic;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pause between polls in the multi-topic wait loops.
const POLL_TICK: Duration = Duration::from_millis(25);

/// Result of a successful [`Signals::send`].
#[derive(Clone, Debug, Serialize)]
pub struct SendOutcome {
    /// Always `true`; failures are errors, not outcomes.
    pub ok: bool,
    /// The topic written to.
    pub topic: String,
    /// Cursor of the appended entry.
    pub cursor: Cursor,
}

/// One signal handed back to a waiter.
#[derive(Clone, Debug, Serialize)]
pub struct ReceivedSignal {
    /// Topic the entry arrived on.
    pub topic: String,
    /// Cursor of the entry within its topic.
    pub cursor: Cursor,
    /// Canonical id of the entry; de-duplication key for consumers.
    pub message_id: Uuid,
    /// The payload, with sensitive keys redacted.
    pub payload: Value,
}

/// Result of [`Signals::wait`] and [`Signals::wait_any`].
#[derive(Clone, Debug, Serialize)]
pub struct WaitOutcome {
    /// Whether a signal arrived before the deadline.
    pub ok: bool,
    /// The received signal, when `ok`.
    #[serde(flatten)]
    pub signal: Option<ReceivedSignal>,
    /// The configured timeout, echoed back on timeout outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WaitOutcome {
    fn received(signal: ReceivedSignal) -> Self {
        Self {
            ok: true,
            signal: Some(signal),
            timeout_ms: None,
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            ok: false,
            signal: None,
            timeout_ms: Some(duration_ms(timeout)),
        }
    }
}

/// Result of [`Signals::wait_all`].
#[derive(Clone, Debug, Serialize)]
pub struct BarrierOutcome {
    /// Whether every topic fired before the deadline.
    pub ok: bool,
    /// Signals received so far, in the caller's topic order.
    pub received: Vec<ReceivedSignal>,
    /// Topics that had not fired when the deadline passed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
    /// The configured timeout, echoed back on timeout outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// The signal layer over a shared bus handle.
///
/// Holds a tail-mode bus handle (signal waits are cursor reads, not group
/// consumption) and the [`SignalPolicy`] applied to every operation.
#[derive(Clone)]
pub struct Signals {
    bus: Arc<dyn Bus>,
    policy: SignalPolicy,
}

impl Signals {
    /// Create a signal layer with the default policy.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            policy: SignalPolicy::default(),
        }
    }

    /// Replace the policy.
    #[must_use]
    pub fn with_policy(mut self, policy: SignalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &SignalPolicy {
        &self.policy
    }

    /// The bus this layer publishes and reads on.
    #[must_use]
    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }

    /// Publish a small JSON payload to a signal topic.
    ///
    /// When `conversation_id` is known, a `signal_send` visibility event
    /// (topic + cursor + payload length, never the payload) is mirrored onto
    /// that conversation's stream.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::PolicyViolation`] or
    /// [`SignalError::PayloadTooLarge`] before any bus write, and
    /// [`SignalError::Bus`] when the publish itself fails.
    pub async fn send(
        &self,
        topic: &str,
        payload: Value,
        conversation_id: Option<&str>,
    ) -> Result<SendOutcome, SignalError> {
        self.policy.check_topic(topic)?;
        let encoded =
            serde_json::to_string(&payload).map_err(|e| SignalError::Encode(e.to_string()))?;
        self.policy.check_payload_size(encoded.len())?;

        let payload_bytes = encoded.len();
        let message = BusMessage::new(encoded);
        let cursor = self.bus.publish(topic, &message).await?;
        metrics::counter!("signals.sent.total").increment(1);
        tracing::debug!(topic = %topic, cursor = %cursor, "Signal sent");

        if let Some(conversation_id) = conversation_id {
            self.publish_visibility(StreamEvent::SignalSend {
                conversation_id: conversation_id.to_string(),
                topic: topic.to_string(),
                cursor: Some(cursor.as_str().to_string()),
                payload_bytes,
                extra: Map::new(),
            })
            .await;
        }

        Ok(SendOutcome {
            ok: true,
            topic: topic.to_string(),
            cursor,
        })
    }

    /// Wait for the first entry strictly after `last_cursor` on one topic.
    ///
    /// With no cursor, waits for entries published after this call. A
    /// deadline pass is a structured timeout outcome, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::PolicyViolation`] for disallowed topics and
    /// [`SignalError::Bus`] on transport or cursor errors.
    pub async fn wait(
        &self,
        topic: &str,
        last_cursor: Option<&Cursor>,
        timeout: Duration,
        conversation_id: Option<&str>,
    ) -> Result<WaitOutcome, SignalError> {
        self.policy.check_topic(topic)?;
        let anchor = match last_cursor {
            Some(cursor) => cursor.clone(),
            None => self.bus.latest(topic).await?,
        };

        let entries = self
            .bus
            .read(topic, Some(&anchor), 1, Some(timeout))
            .await?;
        match entries.into_iter().next() {
            Some(entry) => {
                let signal = self.decode(topic, entry);
                self.notify_received(&signal, conversation_id).await;
                Ok(WaitOutcome::received(signal))
            }
            None => Ok(WaitOutcome::timed_out(timeout)),
        }
    }

    /// Wait for the first entry across a set of topics; the outcome reports
    /// which topic fired.
    ///
    /// `last_cursors`, when given, pairs with `topics` by index; `None`
    /// entries anchor at the live tail.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::PolicyViolation`] if any topic is disallowed
    /// and [`SignalError::Bus`] on transport or cursor errors.
    pub async fn wait_any(
        &self,
        topics: &[String],
        last_cursors: Option<&[Option<Cursor>]>,
        timeout: Duration,
        conversation_id: Option<&str>,
    ) -> Result<WaitOutcome, SignalError> {
        let anchors = self.anchor_all(topics, last_cursors).await?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            for (topic, anchor) in topics.iter().zip(&anchors) {
                let entries = self.bus.read(topic, Some(anchor), 1, None).await?;
                if let Some(entry) = entries.into_iter().next() {
                    let signal = self.decode(topic, entry);
                    self.notify_received(&signal, conversation_id).await;
                    return Ok(WaitOutcome::received(signal));
                }
            }
            if !sleep_tick(deadline).await {
                return Ok(WaitOutcome::timed_out(timeout));
            }
        }
    }

    /// Wait until at least one new entry has been observed on every topic.
    ///
    /// On timeout the outcome carries what fired and which topics are still
    /// pending.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::PolicyViolation`] if any topic is disallowed
    /// and [`SignalError::Bus`] on transport or cursor errors.
    pub async fn wait_all(
        &self,
        topics: &[String],
        last_cursors: Option<&[Option<Cursor>]>,
        timeout: Duration,
        conversation_id: Option<&str>,
    ) -> Result<BarrierOutcome, SignalError> {
        let anchors = self.anchor_all(topics, last_cursors).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut received: Vec<Option<ReceivedSignal>> = vec![None; topics.len()];

        loop {
            for (index, (topic, anchor)) in topics.iter().zip(&anchors).enumerate() {
                if received[index].is_some() {
                    continue;
                }
                let entries = self.bus.read(topic, Some(anchor), 1, None).await?;
                if let Some(entry) = entries.into_iter().next() {
                    let signal = self.decode(topic, entry);
                    self.notify_received(&signal, conversation_id).await;
                    received[index] = Some(signal);
                }
            }

            if received.iter().all(Option::is_some) {
                return Ok(BarrierOutcome {
                    ok: true,
                    received: received.into_iter().flatten().collect(),
                    pending: Vec::new(),
                    timeout_ms: None,
                });
            }
            if !sleep_tick(deadline).await {
                let pending = topics
                    .iter()
                    .zip(&received)
                    .filter(|(_, signal)| signal.is_none())
                    .map(|(topic, _)| topic.clone())
                    .collect();
                return Ok(BarrierOutcome {
                    ok: false,
                    received: received.into_iter().flatten().collect(),
                    pending,
                    timeout_ms: Some(duration_ms(timeout)),
                });
            }
        }
    }

    /// Resolve the starting cursor for every topic, checking policy as we go.
    async fn anchor_all(
        &self,
        topics: &[String],
        last_cursors: Option<&[Option<Cursor>]>,
    ) -> Result<Vec<Cursor>, SignalError> {
        let mut anchors = Vec::with_capacity(topics.len());
        for (index, topic) in topics.iter().enumerate() {
            self.policy.check_topic(topic)?;
            let provided = last_cursors
                .and_then(|cursors| cursors.get(index))
                .and_then(Clone::clone);
            let anchor = match provided {
                Some(cursor) => cursor,
                None => self.bus.latest(topic).await?,
            };
            anchors.push(anchor);
        }
        Ok(anchors)
    }

    fn decode(&self, topic: &str, entry: BusEntry) -> ReceivedSignal {
        let payload = match serde_json::from_str(&entry.message.payload) {
            Ok(value) => self.policy.redact(value),
            Err(e) => {
                tracing::warn!(topic = %topic, cursor = %entry.cursor, error = %e, "Malformed signal payload");
                Value::Null
            }
        };
        ReceivedSignal {
            topic: topic.to_string(),
            cursor: entry.cursor,
            message_id: entry.message.id,
            payload,
        }
    }

    async fn notify_received(&self, signal: &ReceivedSignal, conversation_id: Option<&str>) {
        let Some(conversation_id) = conversation_id else {
            return;
        };
        let payload_bytes = signal.payload.to_string().len();
        self.publish_visibility(StreamEvent::SignalRecv {
            conversation_id: conversation_id.to_string(),
            topic: signal.topic.clone(),
            cursor: Some(signal.cursor.as_str().to_string()),
            payload_bytes,
            extra: Map::new(),
        })
        .await;
    }

    /// Visibility publishes are best-effort; coordination never fails because
    /// an observer stream is behind.
    async fn publish_visibility(&self, event: StreamEvent) {
        let conversation_id = event.conversation_id().to_string();
        let Ok(payload) = event.to_payload() else {
            return;
        };
        let egress = topic::stream(&conversation_id);
        if let Err(e) = self.bus.publish(&egress, &BusMessage::new(payload)).await {
            tracing::warn!(topic = %egress, error = %e, "Failed to publish visibility event");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sleep one poll tick, bounded by the deadline. Returns `false` once the
/// deadline has passed.
async fn sleep_tick(deadline: tokio::time::Instant) -> bool {
    let now = tokio::time::Instant::now();
    if now >= deadline {
        return false;
    }
    tokio::time::sleep((deadline - now).min(POLL_TICK)).await;
    true
}
