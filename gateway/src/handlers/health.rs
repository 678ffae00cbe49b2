//! `GET /health` and `GET /ready`.

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

/// Liveness: 200 whenever the process answers at all.
pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Readiness: 200 when the bus answers a lightweight probe, 503 otherwise.
///
/// # Errors
///
/// Returns `503 BUS_UNAVAILABLE` when the probe fails.
pub async fn ready(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state.bus().probe().await?;
    Ok(Json(json!({ "ok": true })))
}
