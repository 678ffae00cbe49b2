//! # Agent Mesh Gateway
//!
//! HTTP ingress and SSE egress over the bus.
//!
//! ```text
//! client ──POST /send──► chat:<agent> / chat:<conversation_id>
//! client ◄─GET /stream/{id}── stream:<conversation_id>
//! ```
//!
//! The gateway is a thin shell: it validates envelopes, publishes them, and
//! tails egress topics back out as server-sent events with cursor-based
//! resume. It holds no per-conversation state; every SSE generator is
//! one-per-connection and reads the bus independently.
//!
//! # Example
//!
//! ```
//! use agent_mesh_core::MemoryBus;
//! use agent_mesh_gateway::{router, AppState, GatewayConfig};
//! use std::sync::Arc;
//!
//! let state = AppState::new(Arc::new(MemoryBus::new()), GatewayConfig::default());
//! let app: axum::Router = router(state);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;

pub use config::GatewayConfig;
pub use error::AppError;
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the gateway router over shared state.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/send", post(handlers::send::send))
        .route("/stream/:conversation_id", get(handlers::stream::stream))
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
