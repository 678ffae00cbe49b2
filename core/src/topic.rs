//! Topic namespace shared by every bus backend.
//!
//! Topic names are plain strings with a `scheme:` prefix; the namespace is
//! uniform across backends so a conversation looks the same on the in-process
//! bus and on Redis Streams:
//!
//! - `chat:<conversation_id>` - inbound for a conversation
//! - `chat:<agent_name>` - inbound addressed to an agent
//! - `stream:<conversation_id>` - egress fan-out of run events
//! - `signal:<scope>/<event>` - coordination
//! - `control:<agent_name>` - reserved for lifecycle
//!
//! Everything that builds a topic name goes through this module so the
//! convention has exactly one owner.

/// Prefix of inbound conversation/agent topics.
pub const CHAT_PREFIX: &str = "chat:";

/// Prefix of egress event topics.
pub const STREAM_PREFIX: &str = "stream:";

/// Prefix of coordination topics.
pub const SIGNAL_PREFIX: &str = "signal:";

/// Prefix of reserved lifecycle topics.
pub const CONTROL_PREFIX: &str = "control:";

/// Inbound topic for a conversation or a named agent.
#[must_use]
pub fn chat(target: &str) -> String {
    format!("{CHAT_PREFIX}{target}")
}

/// Egress topic for a conversation's run events.
#[must_use]
pub fn stream(conversation_id: &str) -> String {
    format!("{STREAM_PREFIX}{conversation_id}")
}

/// Coordination topic for a named signal.
#[must_use]
pub fn signal(name: &str) -> String {
    format!("{SIGNAL_PREFIX}{name}")
}

/// Reserved lifecycle topic for an agent.
#[must_use]
pub fn control(agent_name: &str) -> String {
    format!("{CONTROL_PREFIX}{agent_name}")
}

/// Whether a fully-qualified topic is a signal topic.
#[must_use]
pub fn is_signal(topic: &str) -> bool {
    topic.starts_with(SIGNAL_PREFIX)
}

/// The inbound topics an envelope is published to.
///
/// `agent:` recipients fan out to the agent's topic and the conversation
/// topic so passive observers of the conversation see the envelope too;
/// `chat:` recipients go to the conversation topic only. Ingress and the
/// orchestration helper share this routing.
#[must_use]
pub fn inbound_topics(envelope: &crate::envelope::Envelope) -> Vec<String> {
    match &envelope.recipient {
        crate::envelope::Recipient::Agent(name) => {
            vec![chat(name), chat(&envelope.conversation_id)]
        }
        crate::envelope::Recipient::Chat(conversation_id) => vec![chat(conversation_id)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_apply_prefixes() {
        assert_eq!(chat("c1"), "chat:c1");
        assert_eq!(chat("planner"), "chat:planner");
        assert_eq!(stream("c1"), "stream:c1");
        assert_eq!(signal("teamA/done"), "signal:teamA/done");
        assert_eq!(control("planner"), "control:planner");
    }

    #[test]
    fn signal_topics_are_recognizable() {
        assert!(is_signal(&signal("orchestrate/p/0/done")));
        assert!(!is_signal(&chat("c1")));
    }

    #[test]
    fn agent_recipients_fan_out_to_both_topics() {
        use crate::envelope::{Envelope, Recipient, Sender};

        let to_agent = Envelope::new(
            "c1",
            Sender::User("u".to_string()),
            Recipient::Agent("planner".to_string()),
            None,
        );
        assert_eq!(inbound_topics(&to_agent), vec!["chat:planner", "chat:c1"]);

        let to_chat = Envelope::new(
            "c1",
            Sender::User("u".to_string()),
            Recipient::Chat("c1".to_string()),
            None,
        );
        assert_eq!(inbound_topics(&to_chat), vec!["chat:c1"]);
    }
}
