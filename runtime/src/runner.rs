//! The Runner contract: the seam between the worker and the reasoning layer.
//!
//! A [`Runner`] turns one envelope into a lazy, finite sequence of stream
//! events. The LLM adapter, its tools and its prompt plumbing all live behind
//! this trait; the worker only drains the sequence and mirrors it onto the
//! conversation's egress topic.
//!
//! # Protocol
//!
//! - The sequence is consumed single-threaded per call.
//! - Exactly one terminal [`StreamEvent::Output`] must be emitted per call.
//! - If the Runner yields an error (or breaks protocol), the worker
//!   synthesizes the terminal event on its behalf.
//!
//! Push-style adapters that produce events from callbacks or another thread
//! bridge through [`run_channel`], which hands back a sender half and the
//! lazy stream the worker consumes.

use crate::session::SessionHandle;
use agent_mesh_core::envelope::Envelope;
use agent_mesh_core::event::StreamEvent;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors a Runner may yield mid-sequence.
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    /// The adapter failed; the message is surfaced in the synthetic output.
    #[error("Runner failed: {0}")]
    Failed(String),
}

/// Lazy, finite sequence of events produced by one run.
pub type RunStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, RunnerError>> + Send>>;

/// A pluggable reasoning adapter.
///
/// Implementations must be `Send + Sync`; a single worker invokes `run`
/// sequentially, but the trait object is shared across tasks.
pub trait Runner: Send + Sync {
    /// Start a run for one envelope against its conversation session.
    ///
    /// The returned stream is lazy: no work happens until the worker polls
    /// it. The session handle is the per-conversation state owned by the
    /// worker; adapters may read history from it and append their reply.
    fn run(&self, envelope: Envelope, session: SessionHandle) -> RunStream;
}

/// Bridge for push-style adapters: returns a sender half and the lazy
/// [`RunStream`] fed by it.
///
/// The stream ends when the sender is dropped. Synchronous adapters running
/// on a blocking thread use `blocking_send`; async ones use `send`.
#[must_use]
pub fn run_channel(buffer: usize) -> (mpsc::Sender<Result<StreamEvent, RunnerError>>, RunStream) {
    let (tx, rx) = mpsc::channel(buffer);
    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(item) = rx.recv().await {
            yield item;
        }
    };
    (tx, Box::pin(stream))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn run_channel_bridges_pushed_events_in_order() {
        let (tx, mut stream) = run_channel(8);

        tokio::spawn(async move {
            tx.send(Ok(StreamEvent::token("c1", "h", 0))).await.unwrap();
            tx.send(Ok(StreamEvent::token("c1", "i", 1))).await.unwrap();
            tx.send(Ok(StreamEvent::output("c1", "hi"))).await.unwrap();
        });

        let mut texts = Vec::new();
        while let Some(Ok(event)) = stream.next().await {
            texts.push(event.event_type());
        }
        assert_eq!(texts, vec!["token", "token", "output"]);
    }

    #[tokio::test]
    async fn run_channel_ends_when_sender_drops() {
        let (tx, mut stream) = run_channel(1);
        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
