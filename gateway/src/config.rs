//! Gateway configuration.
//!
//! Plain data, filled by the binary from flags/environment and passed to
//! [`AppState`](crate::AppState); handlers never read ambient state.

use std::time::Duration;

/// Tunables for the gateway process.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Per-connection event cap applied to every SSE stream
    /// (`GATEWAY_MAX_EVENTS`); `None` means unbounded.
    pub max_events: Option<usize>,
    /// Block duration for each egress read; also the upper bound on idle
    /// latency between batches.
    pub read_block: Duration,
    /// Max entries fetched per egress read.
    pub read_batch: usize,
    /// Idle interval after which a keep-alive comment is written.
    pub heartbeat: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_events: None,
            read_block: Duration::from_millis(100),
            read_batch: 64,
            heartbeat: Duration::from_secs(15),
        }
    }
}

impl GatewayConfig {
    /// Defaults with a per-connection event cap.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }
}
