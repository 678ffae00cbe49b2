//! `POST /send`: validated ingress onto the bus.
//!
//! The body is parsed in two steps so clients can tell syntax from schema:
//! unparseable JSON is 400, a parseable body that violates the envelope
//! schema (missing fields, unknown address scheme, unknown `type`) is 422.
//! Nothing reaches the bus until validation has passed.

use crate::error::AppError;
use crate::state::AppState;
use agent_mesh_core::bus::BusMessage;
use agent_mesh_core::envelope::{Envelope, EnvelopeKind, Recipient, Sender};
use agent_mesh_core::topic;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Wire shape accepted by `/send`.
///
/// `id` and `created_at` are optional: supplied values are used verbatim
/// (the gateway does not deduplicate), missing ones are generated.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Client-supplied envelope id, used verbatim when present.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Routing key for egress and session state.
    pub conversation_id: String,
    /// `user:<id>` or `agent:<name>`.
    pub sender: Sender,
    /// `chat:<conversation_id>` or `agent:<name>`.
    pub recipient: Recipient,
    /// `message` or `control`.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Optional text body.
    #[serde(default)]
    pub content: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Client-supplied timestamp, used verbatim when present.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Success body for `/send`.
#[derive(Debug, Serialize)]
pub struct SendResponse {
    /// Always `true` on the success path.
    pub ok: bool,
    /// Canonical id of the published envelope.
    pub id: Uuid,
    /// Topics the envelope was appended to, in publish order.
    pub published_to: Vec<String>,
}

/// Handle `POST /send`.
///
/// # Errors
///
/// `400` for malformed JSON, `422` for schema violations, `503` when the bus
/// rejects the publish.
pub async fn send(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendResponse>, AppError> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("malformed JSON: {e}")))?;
    let request: SendRequest =
        serde_json::from_value(value).map_err(|e| AppError::validation(e.to_string()))?;

    if request.conversation_id.is_empty() {
        return Err(AppError::validation("conversation_id must not be empty"));
    }

    let envelope = Envelope {
        id: request.id.unwrap_or_else(Uuid::new_v4),
        conversation_id: request.conversation_id,
        sender: request.sender,
        recipient: request.recipient,
        kind: request.kind,
        content: request.content,
        metadata: request.metadata,
        created_at: request.created_at.unwrap_or_else(Utc::now),
    };
    let payload = envelope
        .to_payload()
        .map_err(|e| AppError::internal("failed to encode envelope").with_source(e.into()))?;

    let published_to = topic::inbound_topics(&envelope);
    for inbound in &published_to {
        state
            .bus()
            .publish(inbound, &BusMessage::with_id(envelope.id, payload.clone()))
            .await?;
    }

    metrics::counter!("gateway.send.total").increment(1);
    tracing::info!(
        envelope_id = %envelope.id,
        conversation_id = %envelope.conversation_id,
        recipient = %envelope.recipient,
        published_to = ?published_to,
        "Envelope accepted"
    );

    Ok(Json(SendResponse {
        ok: true,
        id: envelope.id,
        published_to,
    }))
}
