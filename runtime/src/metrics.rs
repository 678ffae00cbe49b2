//! Metric registration for the runtime.
//!
//! The core emits through the `metrics` facade only; binaries decide whether
//! to install an exporter. Call [`register_metrics`] once at startup so
//! whatever recorder is installed has descriptions for everything the
//! pipeline emits.

use metrics::describe_counter;

/// Register descriptions for every metric the pipeline emits.
///
/// Safe to call more than once; descriptions are idempotent.
pub fn register_metrics() {
    describe_counter!(
        "worker.envelopes.total",
        "Envelopes drained from inbound topics"
    );
    describe_counter!(
        "worker.runner.errors",
        "Runner failures converted to synthetic error outputs"
    );
    describe_counter!(
        "worker.publish.retries",
        "Egress publish attempts that needed a retry"
    );
    describe_counter!("gateway.send.total", "Envelopes accepted by POST /send");
    describe_counter!("gateway.stream.connections", "SSE connections opened");
    describe_counter!(
        "signals.sent.total",
        "Signals published through the coordination layer"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        register_metrics();
        register_metrics();
    }
}
