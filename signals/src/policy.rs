//! Policy gate for the signal layer.
//!
//! Three controls, all configurable: a topic-prefix allowlist, a payload
//! size cap, and a list of sensitive keys redacted from payloads handed back
//! to waiters. Policy failures are structured errors raised before any bus
//! write.

use serde_json::Value;
use thiserror::Error;

/// Default payload size cap in bytes.
pub const DEFAULT_PAYLOAD_MAX_BYTES: usize = 64 * 1024;

/// Keys redacted from returned payloads by default.
pub const DEFAULT_REDACT_KEYS: &[&str] =
    &["token", "secret", "password", "api_key", "authorization"];

const REDACTED: &str = "[redacted]";

/// Errors from the signal layer.
#[derive(Error, Debug)]
pub enum SignalError {
    /// The topic falls outside the configured allowlist.
    #[error("Policy violation: topic '{topic}' is outside the allowed prefix '{prefix}'")]
    PolicyViolation {
        /// The rejected topic.
        topic: String,
        /// The required prefix.
        prefix: String,
    },

    /// The payload exceeds the configured cap.
    #[error("Payload of {size} bytes exceeds the cap of {cap} bytes")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Configured cap.
        cap: usize,
    },

    /// The payload could not be encoded as JSON.
    #[error("Failed to encode signal payload: {0}")]
    Encode(String),

    /// The underlying bus failed.
    #[error(transparent)]
    Bus(#[from] agent_mesh_core::bus::BusError),
}

/// Configurable policy applied to every send and wait.
#[derive(Clone, Debug)]
pub struct SignalPolicy {
    topic_prefix: Option<String>,
    payload_max_bytes: usize,
    redact_keys: Vec<String>,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            topic_prefix: None,
            payload_max_bytes: DEFAULT_PAYLOAD_MAX_BYTES,
            redact_keys: DEFAULT_REDACT_KEYS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl SignalPolicy {
    /// Policy with defaults: any topic, 64 KiB cap, standard redaction list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require topics to start with the given prefix. An empty prefix means
    /// allow all.
    #[must_use]
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.topic_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    /// Override the payload size cap.
    #[must_use]
    pub const fn with_payload_max_bytes(mut self, cap: usize) -> Self {
        self.payload_max_bytes = cap;
        self
    }

    /// Replace the redaction key list.
    #[must_use]
    pub fn with_redact_keys(mut self, keys: Vec<String>) -> Self {
        self.redact_keys = keys;
        self
    }

    /// Read the policy from the process environment: `SIGNAL_TOPIC_PREFIX`
    /// (empty allows all) and `SIGNAL_PAYLOAD_MAX_BYTES`.
    ///
    /// For binary edges only; unparseable values keep the defaults with a
    /// warning rather than blocking coordination.
    #[must_use]
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Ok(prefix) = std::env::var("SIGNAL_TOPIC_PREFIX") {
            policy = policy.with_topic_prefix(prefix);
        }
        if let Ok(raw) = std::env::var("SIGNAL_PAYLOAD_MAX_BYTES") {
            match raw.parse() {
                Ok(cap) => policy = policy.with_payload_max_bytes(cap),
                Err(_) => {
                    tracing::warn!(
                        value = %raw,
                        "SIGNAL_PAYLOAD_MAX_BYTES is not an integer; keeping the default"
                    );
                }
            }
        }
        policy
    }

    /// Check a topic against the allowlist.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::PolicyViolation`] when a prefix is configured
    /// and the topic does not start with it.
    pub fn check_topic(&self, topic: &str) -> Result<(), SignalError> {
        match &self.topic_prefix {
            Some(prefix) if !topic.starts_with(prefix.as_str()) => {
                Err(SignalError::PolicyViolation {
                    topic: topic.to_string(),
                    prefix: prefix.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Check an encoded payload against the size cap.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::PayloadTooLarge`] when the payload exceeds the
    /// cap.
    pub const fn check_payload_size(&self, size: usize) -> Result<(), SignalError> {
        if size > self.payload_max_bytes {
            return Err(SignalError::PayloadTooLarge {
                size,
                cap: self.payload_max_bytes,
            });
        }
        Ok(())
    }

    /// Redact sensitive keys, recursively, in a payload about to be handed
    /// back to a waiter.
    #[must_use]
    pub fn redact(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, inner)| {
                        if self.is_sensitive(&key) {
                            (key, Value::String(REDACTED.to_string()))
                        } else {
                            (key, self.redact(inner))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.redact(item)).collect())
            }
            other => other,
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.redact_keys.iter().any(|candidate| key == *candidate)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_env_reads_prefix_and_cap() {
        std::env::set_var("SIGNAL_TOPIC_PREFIX", "signal:");
        std::env::set_var("SIGNAL_PAYLOAD_MAX_BYTES", "128");
        let policy = SignalPolicy::from_env();
        assert!(policy.check_topic("signal:x").is_ok());
        assert!(policy.check_topic("chat:x").is_err());
        assert!(policy.check_payload_size(129).is_err());

        // Unparseable cap keeps the default instead of failing.
        std::env::set_var("SIGNAL_PAYLOAD_MAX_BYTES", "lots");
        let policy = SignalPolicy::from_env();
        assert!(policy.check_payload_size(129).is_ok());

        std::env::remove_var("SIGNAL_TOPIC_PREFIX");
        std::env::remove_var("SIGNAL_PAYLOAD_MAX_BYTES");
    }

    #[test]
    fn no_prefix_allows_everything() {
        let policy = SignalPolicy::new();
        assert!(policy.check_topic("signal:teamA/done").is_ok());
        assert!(policy.check_topic("chat:foo").is_ok());
    }

    #[test]
    fn prefix_rejects_foreign_topics() {
        let policy = SignalPolicy::new().with_topic_prefix("signal:");
        assert!(policy.check_topic("signal:teamA/done").is_ok());
        let err = policy.check_topic("chat:foo").unwrap_err();
        assert!(matches!(err, SignalError::PolicyViolation { .. }));
    }

    #[test]
    fn empty_prefix_means_allow_all() {
        let policy = SignalPolicy::new().with_topic_prefix("");
        assert!(policy.check_topic("chat:foo").is_ok());
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let policy = SignalPolicy::new().with_payload_max_bytes(8);
        assert!(policy.check_payload_size(8).is_ok());
        assert!(matches!(
            policy.check_payload_size(9),
            Err(SignalError::PayloadTooLarge { size: 9, cap: 8 })
        ));
    }

    #[test]
    fn redaction_is_recursive_and_case_insensitive() {
        let policy = SignalPolicy::new();
        let redacted = policy.redact(json!({
            "Token": "abc",
            "nested": { "api_key": "xyz", "note": "keep" },
            "list": [{ "password": "hunter2" }],
        }));
        assert_eq!(redacted["Token"], "[redacted]");
        assert_eq!(redacted["nested"]["api_key"], "[redacted]");
        assert_eq!(redacted["nested"]["note"], "keep");
        assert_eq!(redacted["list"][0]["password"], "[redacted]");
    }
}
