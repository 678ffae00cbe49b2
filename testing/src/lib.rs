//! # Agent Mesh Testing
//!
//! Deterministic test doubles and helpers for the Agent Mesh pipeline:
//!
//! - [`ScriptedRunner`] - a [`Runner`] with fixed, per-call behavior
//!   (reply, echo, fail, stall) so worker semantics are testable without a
//!   model
//! - [`collect_events`] - drain an egress topic into decoded events
//! - [`test_envelope`] - a minimal envelope addressed to an agent
//!
//! ## Example
//!
//! ```
//! use agent_mesh_testing::{test_envelope, ScriptedRunner};
//! use agent_mesh_runtime::Runner;
//! use agent_mesh_runtime::SessionStore;
//! use futures::StreamExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let runner = ScriptedRunner::reply("hi");
//! let sessions = SessionStore::new();
//! let envelope = test_envelope("c1", "planner", "hello");
//!
//! let events: Vec<_> = runner
//!     .run(envelope, sessions.handle("c1"))
//!     .collect()
//!     .await;
//! // "h", "i" tokens followed by the terminal output.
//! assert_eq!(events.len(), 3);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use agent_mesh_core::bus::{Bus, Cursor};
use agent_mesh_core::envelope::{Envelope, Recipient, Sender};
use agent_mesh_core::event::StreamEvent;
use agent_mesh_runtime::runner::{RunStream, Runner, RunnerError};
use agent_mesh_runtime::session::SessionHandle;
use std::time::Duration;

/// What a [`ScriptedRunner`] does with every envelope it receives.
#[derive(Clone, Debug)]
enum Script {
    /// Stream `text` one character per token, then emit it as the output.
    Reply(String),
    /// Reply with the envelope's own content.
    Echo,
    /// Emit one token, then fail with the given reason.
    Fail(String),
    /// Emit one token and never produce a terminal event.
    Stall,
}

/// A [`Runner`] with fixed behavior, for exercising the worker pipeline.
#[derive(Clone, Debug)]
pub struct ScriptedRunner {
    script: Script,
}

impl ScriptedRunner {
    /// Stream `text` token by token, then emit it as the terminal output.
    #[must_use]
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            script: Script::Reply(text.into()),
        }
    }

    /// Reply with each envelope's own content.
    #[must_use]
    pub const fn echo() -> Self {
        Self {
            script: Script::Echo,
        }
    }

    /// Emit one token, then yield a runner error.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            script: Script::Fail(reason.into()),
        }
    }

    /// Emit one token and then stall forever, a protocol violation the
    /// worker must time out.
    #[must_use]
    pub const fn stalling() -> Self {
        Self {
            script: Script::Stall,
        }
    }
}

impl Runner for ScriptedRunner {
    fn run(&self, envelope: Envelope, _session: SessionHandle) -> RunStream {
        let script = self.script.clone();
        let conversation_id = envelope.conversation_id.clone();
        let stream = async_stream::stream! {
            match script {
                Script::Reply(text) => {
                    for (index, ch) in text.chars().enumerate() {
                        yield Ok(StreamEvent::token(&conversation_id, ch.to_string(), index as u64));
                    }
                    yield Ok(StreamEvent::output(&conversation_id, text));
                }
                Script::Echo => {
                    let text = envelope.content.clone().unwrap_or_default();
                    for (index, ch) in text.chars().enumerate() {
                        yield Ok(StreamEvent::token(&conversation_id, ch.to_string(), index as u64));
                    }
                    yield Ok(StreamEvent::output(&conversation_id, text));
                }
                Script::Fail(reason) => {
                    yield Ok(StreamEvent::token(&conversation_id, "x", 0));
                    yield Err(RunnerError::Failed(reason));
                }
                Script::Stall => {
                    yield Ok(StreamEvent::token(&conversation_id, "x", 0));
                    futures::future::pending::<()>().await;
                }
            }
        };
        Box::pin(stream)
    }
}

/// A minimal `message` envelope from `user:test` to `agent:<agent>`.
#[must_use]
pub fn test_envelope(conversation_id: &str, agent: &str, content: &str) -> Envelope {
    Envelope::new(
        conversation_id,
        Sender::User("test".to_string()),
        Recipient::Agent(agent.to_string()),
        Some(content.to_string()),
    )
}

/// Read an egress topic until `count` decodable events arrived or `timeout`
/// passed, returning them with their cursors.
///
/// Entries that do not decode as stream events are skipped.
pub async fn collect_events(
    bus: &dyn Bus,
    topic: &str,
    after: &Cursor,
    count: usize,
    timeout: Duration,
) -> Vec<(Cursor, StreamEvent)> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut cursor = after.clone();
    let mut events = Vec::new();

    while events.len() < count {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = count - events.len();
        let Ok(entries) = bus
            .read(topic, Some(&cursor), remaining, Some((deadline - now).min(Duration::from_millis(100))))
            .await
        else {
            break;
        };
        for entry in entries {
            cursor = entry.cursor.clone();
            if let Ok(event) = StreamEvent::from_payload(&entry.message.payload) {
                events.push((entry.cursor, event));
            }
        }
    }
    events
}

/// Install a compact tracing subscriber for a test binary; repeat calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use agent_mesh_runtime::SessionStore;
    use futures::StreamExt;

    #[tokio::test]
    async fn reply_script_reconstructs_its_text() {
        let runner = ScriptedRunner::reply("hi");
        let sessions = SessionStore::new();
        let events: Vec<_> = runner
            .run(test_envelope("c1", "a", "ignored"), sessions.handle("c1"))
            .collect()
            .await;

        let mut concatenated = String::new();
        let mut output = None;
        for event in events {
            match event.unwrap() {
                StreamEvent::Token { text, .. } => concatenated.push_str(&text),
                StreamEvent::Output { text, .. } => output = Some(text),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(concatenated, "hi");
        assert_eq!(output.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn failing_script_yields_an_error_mid_stream() {
        let runner = ScriptedRunner::failing("boom");
        let sessions = SessionStore::new();
        let events: Vec<_> = runner
            .run(test_envelope("c1", "a", "x"), sessions.handle("c1"))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_err());
    }
}
