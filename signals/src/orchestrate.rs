//! Fan-out/fan-in orchestration over the bus.
//!
//! [`Orchestrator::split`] publishes N child envelopes (fresh conversation
//! ids, orchestration hints in metadata) through the same dual-topic path
//! the gateway uses, and optionally blocks on a signal barrier until every
//! child has reported done. The helper is stateless: parent→child structure
//! lives only in envelope metadata, and `conversation_id` stays the sole
//! routing key.
//!
//! The matching fan-in half is the worker: when auto-done is enabled it sends
//! to `metadata.orchestrate.done_topic` after a child's terminal event.

use crate::{BarrierOutcome, SignalError, Signals};
use agent_mesh_core::bus::BusMessage;
use agent_mesh_core::envelope::{
    Envelope, OrchestrateHints, Recipient, Sender, ORCHESTRATE_METADATA_KEY,
};
use agent_mesh_core::topic;
use serde_json::Map;
use std::time::Duration;
use uuid::Uuid;

/// A fan-out request.
///
/// `responsibilities` pairs with children by index and may be shorter than
/// `n`; unmatched children get the bare task.
#[derive(Clone, Debug)]
pub struct SplitRequest {
    /// Conversation id of the caller; parent of the children.
    pub parent_id: String,
    /// Sender recorded on the child envelopes.
    pub sender: Sender,
    /// The task being split.
    pub task: String,
    /// Number of children.
    pub n: usize,
    /// Per-child responsibility descriptions, by index.
    pub responsibilities: Vec<String>,
    /// Paths the children are allowed to touch.
    pub allowed_paths: Vec<String>,
    /// Agent that receives every child envelope.
    pub target_agent: String,
    /// Barrier timeout when waiting.
    pub timeout: Duration,
    /// Whether to block on the completion barrier.
    pub wait: bool,
}

impl SplitRequest {
    /// A request with no responsibilities, no path scoping, a 60s barrier
    /// timeout and no waiting.
    #[must_use]
    pub fn new(
        parent_id: impl Into<String>,
        sender: Sender,
        task: impl Into<String>,
        n: usize,
        target_agent: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: parent_id.into(),
            sender,
            task: task.into(),
            n,
            responsibilities: Vec::new(),
            allowed_paths: Vec::new(),
            target_agent: target_agent.into(),
            timeout: Duration::from_secs(60),
            wait: false,
        }
    }

    /// Set per-child responsibilities.
    #[must_use]
    pub fn with_responsibilities(mut self, responsibilities: Vec<String>) -> Self {
        self.responsibilities = responsibilities;
        self
    }

    /// Scope the children to the given paths.
    #[must_use]
    pub fn with_allowed_paths(mut self, allowed_paths: Vec<String>) -> Self {
        self.allowed_paths = allowed_paths;
        self
    }

    /// Block on the completion barrier with this timeout.
    #[must_use]
    pub const fn waiting(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }
}

/// One published child.
#[derive(Clone, Debug)]
pub struct ChildHandle {
    /// The child's fresh conversation id.
    pub conversation_id: String,
    /// Signal topic the child reports completion on.
    pub done_topic: String,
    /// Canonical id of the child envelope.
    pub envelope_id: Uuid,
}

/// Result of [`Orchestrator::split`].
#[derive(Debug)]
pub struct SplitOutcome {
    /// The parent conversation.
    pub parent_id: String,
    /// Published children, in index order.
    pub children: Vec<ChildHandle>,
    /// Barrier result when the request waited.
    pub barrier: Option<BarrierOutcome>,
}

/// Stateless fan-out helper over the signal layer's bus.
#[derive(Clone)]
pub struct Orchestrator {
    signals: Signals,
}

impl Orchestrator {
    /// Create an orchestrator publishing and waiting through `signals`.
    #[must_use]
    pub const fn new(signals: Signals) -> Self {
        Self { signals }
    }

    /// Fan a task out to `n` child conversations of one agent.
    ///
    /// Each child gets a fresh conversation id, a done topic of the form
    /// `signal:orchestrate/<parent>/<i>/done`, and the orchestration hints in
    /// `metadata.orchestrate`. Envelopes are published to both the agent
    /// topic and the child conversation topic, exactly like gateway ingress.
    /// With `wait`, the call then blocks on `wait_all` over the done topics.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Bus`] when a publish fails; children already
    /// published stay published (receivers de-duplicate by envelope id on
    /// retry). Barrier errors surface unchanged.
    pub async fn split(&self, request: SplitRequest) -> Result<SplitOutcome, SignalError> {
        let bus = self.signals.bus();
        let mut children = Vec::with_capacity(request.n);

        for index in 0..request.n {
            let conversation_id = Uuid::new_v4().to_string();
            let done_topic = topic::signal(&format!(
                "orchestrate/{}/{index}/done",
                request.parent_id
            ));

            let hints = OrchestrateHints {
                parent_id: request.parent_id.clone(),
                done_topic: done_topic.clone(),
                responsibilities: request.responsibilities.get(index).cloned(),
                allowed_paths: request.allowed_paths.clone(),
            };
            let mut metadata = Map::new();
            metadata.insert(
                ORCHESTRATE_METADATA_KEY.to_string(),
                serde_json::to_value(&hints).map_err(|e| SignalError::Encode(e.to_string()))?,
            );

            let envelope = Envelope::new(
                conversation_id.clone(),
                request.sender.clone(),
                Recipient::Agent(request.target_agent.clone()),
                Some(subtask_content(&request, index)),
            )
            .with_metadata(metadata);

            let payload = envelope
                .to_payload()
                .map_err(|e| SignalError::Encode(e.to_string()))?;
            for inbound in topic::inbound_topics(&envelope) {
                bus.publish(&inbound, &BusMessage::with_id(envelope.id, payload.clone()))
                    .await?;
            }

            tracing::debug!(
                parent_id = %request.parent_id,
                child = %conversation_id,
                done_topic = %done_topic,
                "Published child envelope"
            );
            children.push(ChildHandle {
                conversation_id,
                done_topic,
                envelope_id: envelope.id,
            });
        }

        let barrier = if request.wait {
            let done_topics: Vec<String> = children
                .iter()
                .map(|child| child.done_topic.clone())
                .collect();
            Some(
                self.signals
                    .wait_all(&done_topics, None, request.timeout, Some(&request.parent_id))
                    .await?,
            )
        } else {
            None
        };

        Ok(SplitOutcome {
            parent_id: request.parent_id,
            children,
            barrier,
        })
    }
}

fn subtask_content(request: &SplitRequest, index: usize) -> String {
    match request.responsibilities.get(index) {
        Some(responsibility) => format!(
            "[{}/{}] {}\nResponsibility: {responsibility}",
            index + 1,
            request.n,
            request.task
        ),
        None => format!("[{}/{}] {}", index + 1, request.n, request.task),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use agent_mesh_core::bus::{Bus, Cursor};
    use agent_mesh_core::MemoryBus;
    use serde_json::json;
    use std::sync::Arc;

    fn orchestrator() -> (Arc<MemoryBus>, Orchestrator, Signals) {
        let bus = Arc::new(MemoryBus::new());
        let signals = Signals::new(bus.clone());
        (bus, Orchestrator::new(signals.clone()), signals)
    }

    #[tokio::test]
    async fn split_publishes_to_agent_and_child_topics() {
        let (bus, orchestrator, _signals) = orchestrator();
        let agent_anchor = bus.latest("chat:builder").await.unwrap();

        let outcome = orchestrator
            .split(SplitRequest::new(
                "parent-1",
                Sender::Agent("planner".to_string()),
                "refactor the parser",
                2,
                "builder",
            ))
            .await
            .unwrap();

        assert_eq!(outcome.children.len(), 2);
        assert!(outcome.barrier.is_none());

        // Both children land on the agent topic once each.
        let on_agent = bus
            .read("chat:builder", Some(&agent_anchor), 10, None)
            .await
            .unwrap();
        assert_eq!(on_agent.len(), 2);

        // And each child conversation topic carries the same envelope id.
        for (index, child) in outcome.children.iter().enumerate() {
            let child_topic = format!("chat:{}", child.conversation_id);
            let entries = bus
                .read(&child_topic, Some(&Cursor::from("0")), 10, None)
                .await
                .unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].message.id, child.envelope_id);

            let envelope = Envelope::from_payload(&entries[0].message.payload).unwrap();
            let hints = envelope.orchestrate_hints().unwrap();
            assert_eq!(hints.parent_id, "parent-1");
            assert_eq!(
                hints.done_topic,
                format!("signal:orchestrate/parent-1/{index}/done")
            );
            assert!(envelope.content.unwrap().starts_with(&format!("[{}/2]", index + 1)));
        }
    }

    #[tokio::test]
    async fn responsibilities_pair_with_children_by_index() {
        let (bus, orchestrator, _signals) = orchestrator();
        let outcome = orchestrator
            .split(
                SplitRequest::new(
                    "parent-2",
                    Sender::Agent("planner".to_string()),
                    "ship it",
                    2,
                    "builder",
                )
                .with_responsibilities(vec!["tests".to_string()]),
            )
            .await
            .unwrap();

        let first_topic = format!("chat:{}", outcome.children[0].conversation_id);
        let entries = bus.read(&first_topic, Some(&Cursor::from("0")), 1, None).await.unwrap();
        let envelope = Envelope::from_payload(&entries[0].message.payload).unwrap();
        assert!(envelope.content.clone().unwrap().contains("Responsibility: tests"));
        assert_eq!(
            envelope.orchestrate_hints().unwrap().responsibilities,
            Some("tests".to_string())
        );

        // Second child has no responsibility entry.
        let second_topic = format!("chat:{}", outcome.children[1].conversation_id);
        let entries = bus.read(&second_topic, Some(&Cursor::from("0")), 1, None).await.unwrap();
        let envelope = Envelope::from_payload(&entries[0].message.payload).unwrap();
        assert_eq!(envelope.orchestrate_hints().unwrap().responsibilities, None);
    }

    #[tokio::test]
    async fn waiting_split_resolves_when_children_signal_done() {
        let (_bus, orchestrator, signals) = orchestrator();

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator
                    .split(
                        SplitRequest::new(
                            "parent-3",
                            Sender::Agent("planner".to_string()),
                            "do the thing",
                            2,
                            "builder",
                        )
                        .waiting(Duration::from_secs(2)),
                    )
                    .await
            }
        });

        // Children report done on the deterministic topics.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for index in 0..2 {
            signals
                .send(
                    &format!("signal:orchestrate/parent-3/{index}/done"),
                    json!({"output_digest": "ok"}),
                    None,
                )
                .await
                .unwrap();
        }

        let outcome = task.await.unwrap().unwrap();
        let barrier = outcome.barrier.unwrap();
        assert!(barrier.ok);
        assert_eq!(barrier.received.len(), 2);
    }

    #[tokio::test]
    async fn waiting_split_times_out_without_children() {
        let (_bus, orchestrator, _signals) = orchestrator();
        let outcome = orchestrator
            .split(
                SplitRequest::new(
                    "parent-4",
                    Sender::Agent("planner".to_string()),
                    "never done",
                    1,
                    "builder",
                )
                .waiting(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let barrier = outcome.barrier.unwrap();
        assert!(!barrier.ok);
        assert_eq!(barrier.pending.len(), 1);
    }
}
