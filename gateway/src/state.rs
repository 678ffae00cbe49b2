//! Shared state for gateway handlers.

use crate::config::GatewayConfig;
use agent_mesh_core::bus::Bus;
use std::sync::Arc;

/// State shared across all HTTP handlers: the bus handle (tail mode, the
/// gateway never joins a consumer group) and the gateway configuration.
#[derive(Clone)]
pub struct AppState {
    bus: Arc<dyn Bus>,
    config: GatewayConfig,
}

impl AppState {
    /// Create gateway state.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, config: GatewayConfig) -> Self {
        Self { bus, config }
    }

    /// The bus handle.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// The gateway configuration.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_mesh_core::MemoryBus;

    #[test]
    fn state_is_clone_for_axum() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();

        let state = AppState::new(Arc::new(MemoryBus::new()), GatewayConfig::default());
        let _ = state.clone();
    }
}
