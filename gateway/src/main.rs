//! Gateway binary: bind the HTTP server over the configured bus backend.

use agent_mesh_core::MemoryBus;
use agent_mesh_gateway::{router, AppState, GatewayConfig};
use agent_mesh_redis::RedisBus;
use agent_mesh_runtime::shutdown::wait_for_signal;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// HTTP ingress + SSE egress gateway for Agent Mesh.
#[derive(Debug, Parser)]
#[command(name = "agent-mesh-gateway", version, about)]
struct Args {
    /// Address to bind the HTTP server on.
    #[arg(long, env = "GATEWAY_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Bus backend endpoint (e.g. redis://127.0.0.1:6379). Empty selects the
    /// in-process bus, which is visible to this process only.
    #[arg(long, env = "BUS_URL", default_value = "")]
    bus_url: String,

    /// Per-connection cap on SSE events.
    #[arg(long, env = "GATEWAY_MAX_EVENTS")]
    max_events: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    agent_mesh_runtime::metrics::register_metrics();

    let args = Args::parse();

    let bus: Arc<dyn agent_mesh_core::Bus> = if args.bus_url.is_empty() {
        tracing::warn!("BUS_URL is empty; using the in-process bus (single-process mode)");
        Arc::new(MemoryBus::new())
    } else {
        Arc::new(
            RedisBus::connect(&args.bus_url)
                .await
                .context("failed to connect to the bus backend")?,
        )
    };

    let mut config = GatewayConfig::default();
    if let Some(max_events) = args.max_events {
        config = config.with_max_events(max_events);
    }

    let app = router(AppState::new(bus, config));
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await
        .context("server error")?;
    Ok(())
}
