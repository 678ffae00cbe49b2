//! Per-conversation session state owned by the worker.
//!
//! A [`Session`] is the turn history a Runner sees for one conversation.
//! Sessions never cross workers: a given conversation is handled by whichever
//! consumer the group routes it to, so the store is plain process-local
//! state. Nothing here survives a restart; durable memory beyond the bus is
//! out of scope.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Who produced a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnRole {
    /// The inbound envelope's content.
    User,
    /// The run's terminal output.
    Assistant,
}

/// One exchange in a conversation.
#[derive(Clone, Debug)]
pub struct Turn {
    /// Who produced this turn.
    pub role: TurnRole,
    /// The turn text.
    pub content: String,
    /// When the worker recorded it.
    pub created_at: DateTime<Utc>,
}

/// Turn history for one conversation.
#[derive(Debug)]
pub struct Session {
    conversation_id: String,
    turns: Vec<Turn>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turns: Vec::new(),
        }
    }

    /// The conversation this session belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Recorded turns, oldest first.
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Record a user turn.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(TurnRole::User, content);
    }

    /// Record an assistant turn.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(TurnRole::Assistant, content);
    }

    fn push(&mut self, role: TurnRole, content: impl Into<String>) {
        self.turns.push(Turn {
            role,
            content: content.into(),
            created_at: Utc::now(),
        });
    }
}

/// Shared handle to one conversation's session.
pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

/// Process-local map from conversation id to session.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session for a conversation.
    #[must_use]
    pub fn handle(&self, conversation_id: &str) -> SessionHandle {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Session::new(conversation_id)))
            })
            .clone()
    }

    /// Number of conversations with session state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_returns_the_same_session_per_conversation() {
        let store = SessionStore::new();
        let a = store.handle("c1");
        let b = store.handle("c1");
        let other = store.handle("c2");

        a.lock().await.push_user("hello");
        assert_eq!(b.lock().await.turns().len(), 1);
        assert!(other.lock().await.turns().is_empty());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn turns_keep_insertion_order_and_roles() {
        let store = SessionStore::new();
        let session = store.handle("c1");
        {
            let mut session = session.lock().await;
            session.push_user("question");
            session.push_assistant("answer");
        }
        let session = session.lock().await;
        assert_eq!(session.turns()[0].role, TurnRole::User);
        assert_eq!(session.turns()[1].role, TurnRole::Assistant);
    }
}
