//! `GET /stream/{conversation_id}`: SSE egress.
//!
//! Tails `stream:<conversation_id>` and frames each bus entry as one SSE
//! event: the entry's cursor on the `id:` line, the raw event payload on the
//! `data:` line. Resume follows the SSE convention: `Last-Event-ID` (or the
//! explicit `?since=` override) seeks strictly past that cursor; without
//! either, the stream starts at the live tail.
//!
//! The generator never blocks the accept loop: each bus read suspends at
//! most `read_block` (≤100ms), keep-alive comments flow while idle, and a
//! client disconnect drops the generator mid-read, releasing everything.

use crate::error::AppError;
use crate::state::AppState;
use agent_mesh_core::bus::Cursor;
use agent_mesh_core::event::{LogLevel, StreamEvent};
use agent_mesh_core::topic;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;

/// Query parameters for `/stream/{conversation_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Per-connection cap on delivered events; clamped by the gateway cap.
    pub max_events: Option<usize>,
    /// Explicit resume cursor; overrides the `Last-Event-ID` header.
    pub since: Option<String>,
}

/// Handle `GET /stream/{conversation_id}`.
///
/// # Errors
///
/// `422` for `max_events=0` or a malformed resume cursor, `503` when the bus
/// cannot be reached while anchoring the stream.
pub async fn stream(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let egress = topic::stream(&conversation_id);
    let config = state.config().clone();

    // `max_events=0` is a usage error, not "close immediately".
    if params.max_events == Some(0) {
        return Err(AppError::validation("max_events must be at least 1"));
    }
    let max_events = match (params.max_events, config.max_events) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (Some(requested), None) => Some(requested),
        (None, cap) => cap,
    };

    // `?since=` wins over the standard header.
    let resume = params.since.clone().or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    });

    let bus = state.bus().clone();
    let (start, behind_retention) = match resume {
        Some(raw) => {
            let cursor = Cursor::from(raw);
            // Reject malformed cursors before the response starts streaming.
            bus.read(&egress, Some(&cursor), 1, None).await?;
            // Behind retention: strictly before the oldest retained entry,
            // but an explicit "from the floor" read is not a gap.
            let behind = match bus.earliest(&egress).await? {
                Some(earliest) => {
                    bus.compare(&cursor, &earliest) == std::cmp::Ordering::Less
                        && bus.compare(&cursor, &bus.floor()) == std::cmp::Ordering::Greater
                }
                None => false,
            };
            (cursor, behind)
        }
        None => (bus.latest(&egress).await?, false),
    };

    metrics::counter!("gateway.stream.connections").increment(1);
    tracing::info!(
        conversation_id = %conversation_id,
        start = %start,
        max_events = ?max_events,
        "SSE stream opened"
    );

    let stream = async_stream::stream! {
        let mut cursor = start;
        let mut delivered: usize = 0;

        if behind_retention {
            // The resume cursor predates retention; deliver from the
            // earliest retained entry and say so first.
            let warning = StreamEvent::log(
                &conversation_id,
                LogLevel::Warning,
                "gateway",
                "resume cursor is older than retained history; starting from earliest",
            );
            if let Ok(payload) = warning.to_payload() {
                yield Ok(Event::default().id(cursor.as_str()).data(payload));
            }
        }

        'connection: loop {
            let batch = match bus
                .read(&egress, Some(&cursor), config.read_batch, Some(config.read_block))
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(topic = %egress, error = %e, "SSE read failed; closing stream");
                    break 'connection;
                }
            };

            for entry in batch {
                cursor = entry.cursor.clone();
                // Protocol errors never kill the stream: skip and continue.
                if StreamEvent::from_payload(&entry.message.payload).is_err() {
                    tracing::warn!(topic = %egress, cursor = %entry.cursor, "Skipping malformed egress entry");
                    continue;
                }
                yield Ok(Event::default()
                    .id(entry.cursor.as_str())
                    .data(entry.message.payload));
                delivered += 1;
                if let Some(max) = max_events {
                    if delivered >= max {
                        tracing::debug!(topic = %egress, delivered, "SSE event cap reached");
                        break 'connection;
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(config.heartbeat)
            .text("keepalive"),
    ))
}
