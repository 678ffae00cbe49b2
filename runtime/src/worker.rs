//! The subscriber→runner→publisher worker pipeline.
//!
//! A [`Worker`] is bound to one agent name. It drains `chat:<agent>` in
//! consumer-group mode, hands each envelope to the [`Runner`], mirrors the
//! run's events onto `stream:<conversation_id>`, and acknowledges the inbound
//! entry. Envelopes are processed one at a time per consumer; parallelism
//! comes from running more worker processes against the same group.
//!
//! # Failure discipline
//!
//! Every inbound envelope ends in exactly one of: a Runner-emitted terminal
//! output, or a synthetic one (Runner error, protocol violation, publish
//! exhaustion). Either way the entry is acknowledged: redelivery is reserved
//! for crashed consumers, never used as an application retry loop. Malformed
//! entries are logged, counted, acknowledged and skipped.

use crate::retry::{retry_with_backoff, IdleBackoff, RetryPolicy};
use crate::runner::{Runner, RunnerError};
use crate::session::SessionStore;
use crate::shutdown::ShutdownToken;
use agent_mesh_core::bus::{Bus, BusEntry, BusError, BusMessage};
use agent_mesh_core::envelope::{Envelope, EnvelopeKind};
use agent_mesh_core::event::{LogLevel, StreamEvent};
use agent_mesh_core::topic;
use agent_mesh_signals::Signals;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Component name stamped on worker-produced log events.
const COMPONENT: &str = "worker";

/// Errors that abort the worker loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The inbound read path failed with a non-transient error.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The process environment is unusable; fatal at startup.
    #[error("Invalid worker configuration: {0}")]
    Config(String),
}

/// Worker configuration; agent binding and bus location are constructor
/// parameters, never ambient state.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Agent name; the worker consumes `chat:<agent_name>`.
    pub agent_name: String,
    /// Blocking read wait per poll (`WORKER_BLOCK_MS`, default 1s).
    pub block: Duration,
    /// Max entries fetched per read; processing stays one at a time.
    pub read_batch: usize,
    /// Wall-clock budget for one run before the worker synthesizes the
    /// terminal event.
    pub run_timeout: Duration,
    /// Backoff applied to egress publishes.
    pub publish_retry: RetryPolicy,
    /// Emit the orchestration done signal after runs that carry hints
    /// (`ORCHESTRATE_AUTO_DONE`).
    pub auto_done: bool,
}

impl WorkerConfig {
    /// Defaults for an agent: 1s block, batch of 16, 300s run budget.
    #[must_use]
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            block: Duration::from_secs(1),
            read_batch: 16,
            run_timeout: Duration::from_secs(300),
            publish_retry: RetryPolicy::default(),
            auto_done: false,
        }
    }

    /// Override the blocking read wait.
    #[must_use]
    pub const fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Override the per-run wall-clock budget.
    #[must_use]
    pub const fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Override the egress publish retry policy.
    #[must_use]
    pub fn with_publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_retry = policy;
        self
    }

    /// Enable the orchestration completion signal.
    #[must_use]
    pub const fn with_auto_done(mut self, auto_done: bool) -> Self {
        self.auto_done = auto_done;
        self
    }

    /// Read the worker options from the process environment: `AGENT_NAME`
    /// (required), `WORKER_BLOCK_MS` (default 1000) and
    /// `ORCHESTRATE_AUTO_DONE` (`true`/`1` enables).
    ///
    /// For binary edges only; everything downstream takes the plain struct,
    /// so tests never touch ambient state.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] when `AGENT_NAME` is missing or a
    /// value does not parse; misconfiguration is fatal at startup, not
    /// something to limp through.
    pub fn from_env() -> Result<Self, WorkerError> {
        let agent_name = std::env::var("AGENT_NAME")
            .map_err(|_| WorkerError::Config("AGENT_NAME is not set".to_string()))?;
        if agent_name.is_empty() {
            return Err(WorkerError::Config("AGENT_NAME is empty".to_string()));
        }
        let mut config = Self::new(agent_name);

        if let Ok(raw) = std::env::var("WORKER_BLOCK_MS") {
            let block_ms: u64 = raw.parse().map_err(|_| {
                WorkerError::Config(format!("WORKER_BLOCK_MS must be an integer, got '{raw}'"))
            })?;
            config.block = Duration::from_millis(block_ms);
        }
        if let Ok(raw) = std::env::var("ORCHESTRATE_AUTO_DONE") {
            config.auto_done = matches!(raw.as_str(), "1" | "true" | "TRUE" | "True");
        }
        Ok(config)
    }
}

/// A worker bound to one agent name.
///
/// `bus` must be constructed in consumer-group mode (stable group per agent,
/// unique consumer per process); egress publishes go through the same handle.
/// `signals` is used only for the optional orchestration done signal.
pub struct Worker {
    bus: Arc<dyn Bus>,
    runner: Arc<dyn Runner>,
    signals: Option<Signals>,
    sessions: SessionStore,
    config: WorkerConfig,
    shutdown: ShutdownToken,
}

impl Worker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        runner: Arc<dyn Runner>,
        config: WorkerConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            bus,
            runner,
            signals: None,
            sessions: SessionStore::new(),
            config,
            shutdown,
        }
    }

    /// Attach a signal layer for orchestration auto-done.
    #[must_use]
    pub fn with_signals(mut self, signals: Signals) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Run the subscribe loop until shutdown.
    ///
    /// On shutdown the envelope in flight is drained, its terminal event
    /// published and its entry acknowledged before the loop exits; anything
    /// undelivered falls back to the group's claim timeout.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Bus`] only for non-transient read failures
    /// (e.g. a malformed cursor, which indicates a bug); transient
    /// emptiness and transport hiccups are absorbed by backoff.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let inbound = topic::chat(&self.config.agent_name);
        let mut idle = IdleBackoff::default();
        tracing::info!(
            agent = %self.config.agent_name,
            topic = %inbound,
            block_ms = self.config.block.as_millis(),
            "Worker started"
        );

        while !self.shutdown.is_triggered() {
            let batch = tokio::select! {
                biased;
                () = self.shutdown.triggered() => break,
                batch = self.bus.read(&inbound, None, self.config.read_batch, Some(self.config.block)) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e @ BusError::InvalidCursor { .. }) => return Err(e.into()),
                Err(BusError::Unavailable(reason)) => {
                    tracing::warn!(topic = %inbound, error = %reason, "Inbound read failed");
                    tokio::time::sleep(idle.next_delay()).await;
                    continue;
                }
            };

            if batch.is_empty() {
                // The blocking read already paced us; the extra backoff only
                // matters for buses that cannot block.
                if self.config.block.is_zero() {
                    tokio::time::sleep(idle.next_delay()).await;
                }
                continue;
            }

            idle.reset();
            for entry in batch {
                self.process_entry(&inbound, entry).await;
                if self.shutdown.is_triggered() {
                    break;
                }
            }
        }

        tracing::info!(agent = %self.config.agent_name, "Worker stopped");
        Ok(())
    }

    /// Process one inbound entry end to end, always acknowledging it.
    async fn process_entry(&self, inbound: &str, entry: BusEntry) {
        let envelope = match Envelope::from_payload(&entry.message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Protocol error: log, skip, continue. Ack so the malformed
                // entry cannot poison the group.
                tracing::warn!(topic = %inbound, cursor = %entry.cursor, error = %e, "Skipping malformed envelope");
                self.ack(inbound, &entry).await;
                return;
            }
        };

        if envelope.kind == EnvelopeKind::Control {
            // Lifecycle envelopes are published but not interpreted here.
            tracing::debug!(envelope_id = %envelope.id, "Ignoring control envelope");
            self.ack(inbound, &entry).await;
            return;
        }

        metrics::counter!("worker.envelopes.total", "agent" => self.config.agent_name.clone())
            .increment(1);
        tracing::info!(
            envelope_id = %envelope.id,
            conversation_id = %envelope.conversation_id,
            sender = %envelope.sender,
            "Processing envelope"
        );

        let output = self.drive_run(&envelope).await;
        if self.config.auto_done {
            self.emit_done_signal(&envelope, output.as_deref()).await;
        }
        self.ack(inbound, &entry).await;
    }

    /// Drive the Runner for one envelope, mirroring events to egress.
    ///
    /// Returns the terminal output text (the Runner's, or the synthetic one)
    /// for the completion signal.
    async fn drive_run(&self, envelope: &Envelope) -> Option<String> {
        let conversation_id = envelope.conversation_id.clone();
        let egress = topic::stream(&conversation_id);
        let session = self.sessions.handle(&conversation_id);
        if let Some(content) = &envelope.content {
            session.lock().await.push_user(content.clone());
        }

        let mut stream = self.runner.run(envelope.clone(), Arc::clone(&session));
        let deadline = tokio::time::Instant::now() + self.config.run_timeout;

        loop {
            let next = tokio::time::timeout_at(deadline, stream.next()).await;
            match next {
                // Runner protocol violation: no terminal event within budget.
                Err(_) => {
                    tracing::error!(
                        conversation_id = %conversation_id,
                        timeout_s = self.config.run_timeout.as_secs(),
                        "Runner exceeded its run budget"
                    );
                    metrics::counter!("worker.runner.errors").increment(1);
                    let text = format!(
                        "The run was aborted after {}s without completing.",
                        self.config.run_timeout.as_secs()
                    );
                    return self.publish_error_output(&egress, &conversation_id, text).await;
                }
                // Runner ended without its terminal event.
                Ok(None) => {
                    tracing::error!(conversation_id = %conversation_id, "Runner ended without terminal output");
                    metrics::counter!("worker.runner.errors").increment(1);
                    let text = "The run ended without producing output.".to_string();
                    return self.publish_error_output(&egress, &conversation_id, text).await;
                }
                Ok(Some(Ok(event))) => {
                    let terminal = event.is_terminal();
                    let output_text = match &event {
                        StreamEvent::Output { text, .. } => Some(text.clone()),
                        _ => None,
                    };
                    if !self.publish_event(&egress, &event).await {
                        // Egress is down past the retry budget. Surface one
                        // last synthetic output, then ack upstream rather
                        // than loop on a poisoned entry.
                        let text = "Delivery of run output failed; the bus rejected the event stream.".to_string();
                        return self.publish_error_output(&egress, &conversation_id, text).await;
                    }
                    if terminal {
                        if let Some(text) = &output_text {
                            session.lock().await.push_assistant(text.clone());
                        }
                        return output_text;
                    }
                }
                Ok(Some(Err(RunnerError::Failed(reason)))) => {
                    tracing::error!(conversation_id = %conversation_id, error = %reason, "Runner failed");
                    metrics::counter!("worker.runner.errors").increment(1);
                    let text = format!("The run failed: {reason}");
                    return self.publish_error_output(&egress, &conversation_id, text).await;
                }
            }
        }
    }

    /// Publish a diagnostic log followed by the synthetic terminal output.
    async fn publish_error_output(
        &self,
        egress: &str,
        conversation_id: &str,
        text: String,
    ) -> Option<String> {
        let log = StreamEvent::log(conversation_id, LogLevel::Error, COMPONENT, text.clone());
        let _ = self.publish_event(egress, &log).await;

        let output = StreamEvent::output(conversation_id, text.clone());
        if self.publish_event(egress, &output).await {
            Some(text)
        } else {
            tracing::error!(topic = %egress, "Dropping synthetic output; egress unavailable");
            None
        }
    }

    /// Publish one event with capped backoff. Returns `false` once the retry
    /// budget is exhausted.
    async fn publish_event(&self, egress: &str, event: &StreamEvent) -> bool {
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode stream event");
                return false;
            }
        };

        // One canonical id across attempts, so a publish that succeeded
        // under a reported error stays recognizable as a duplicate.
        let message = BusMessage::new(payload);
        let mut attempts: u32 = 0;
        let result = retry_with_backoff(&self.config.publish_retry, || {
            attempts += 1;
            let message = message.clone();
            async move { self.bus.publish(egress, &message).await.map(|_| ()) }
        })
        .await;
        if attempts > 1 {
            metrics::counter!("worker.publish.retries").increment(u64::from(attempts - 1));
        }

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(topic = %egress, error = %e, "Egress publish exhausted retries");
                false
            }
        }
    }

    /// Signal orchestration completion when the envelope carries hints.
    async fn emit_done_signal(&self, envelope: &Envelope, output: Option<&str>) {
        let Some(signals) = &self.signals else {
            return;
        };
        let Some(hints) = envelope.orchestrate_hints() else {
            return;
        };

        let digest: String = output.unwrap_or_default().chars().take(200).collect();
        let payload = json!({ "output_digest": digest });
        match signals
            .send(&hints.done_topic, payload, Some(&envelope.conversation_id))
            .await
        {
            Ok(outcome) => {
                tracing::info!(
                    done_topic = %hints.done_topic,
                    cursor = %outcome.cursor,
                    "Orchestration done signal sent"
                );
            }
            Err(e) => {
                tracing::warn!(done_topic = %hints.done_topic, error = %e, "Failed to send done signal");
            }
        }
    }

    async fn ack(&self, inbound: &str, entry: &BusEntry) {
        if let Err(e) = self.bus.ack(inbound, &entry.cursor).await {
            tracing::warn!(topic = %inbound, cursor = %entry.cursor, error = %e, "Ack failed; entry may be redelivered");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn from_env_requires_agent_name_and_parses_knobs() {
        std::env::remove_var("AGENT_NAME");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerError::Config(_))
        ));

        std::env::set_var("AGENT_NAME", "planner");
        std::env::set_var("WORKER_BLOCK_MS", "250");
        std::env::set_var("ORCHESTRATE_AUTO_DONE", "true");
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.agent_name, "planner");
        assert_eq!(config.block, Duration::from_millis(250));
        assert!(config.auto_done);

        std::env::set_var("WORKER_BLOCK_MS", "soon");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerError::Config(_))
        ));

        std::env::remove_var("AGENT_NAME");
        std::env::remove_var("WORKER_BLOCK_MS");
        std::env::remove_var("ORCHESTRATE_AUTO_DONE");
    }
}
