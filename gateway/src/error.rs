//! Error types for gateway handlers.
//!
//! [`AppError`] bridges runtime errors and HTTP responses with stable,
//! machine-readable codes: `400 BAD_REQUEST` for malformed JSON,
//! `422 VALIDATION_ERROR` for schema violations, `503 BUS_UNAVAILABLE` when
//! the transport is down.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Application error type for gateway handlers.
///
/// Implements Axum's `IntoResponse`, so handlers return
/// `Result<Json<T>, AppError>` and let errors serialize themselves.
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code.
    status: StatusCode,
    /// User-facing message.
    message: String,
    /// Stable error code for client handling.
    code: String,
    /// Internal error for logging, never exposed to the client.
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Attach an internal source error.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400: the request body is not parseable at all.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message.into(),
            "BAD_REQUEST".to_string(),
        )
    }

    /// 422: the body parsed but violates the envelope schema.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            message.into(),
            "VALIDATION_ERROR".to_string(),
        )
    }

    /// 503: the bus did not accept the operation.
    #[must_use]
    pub fn bus_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message.into(),
            "BUS_UNAVAILABLE".to_string(),
        )
    }

    /// 500: anything that should not have happened.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Gateway error"
                );
            } else {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Gateway error"
                );
            }
        }

        let body = ErrorResponse {
            ok: false,
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<agent_mesh_core::BusError> for AppError {
    fn from(err: agent_mesh_core::BusError) -> Self {
        match err {
            agent_mesh_core::BusError::Unavailable(reason) => Self::bus_unavailable(reason),
            agent_mesh_core::BusError::InvalidCursor { topic, cursor } => Self::validation(
                format!("cursor '{cursor}' is not valid for topic '{topic}'"),
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_stable_code() {
        let err = AppError::validation("type must be message or control");
        assert_eq!(
            err.to_string(),
            "[VALIDATION_ERROR] type must be message or control"
        );
    }

    #[test]
    fn bus_errors_map_to_the_right_statuses() {
        let err: AppError =
            agent_mesh_core::BusError::Unavailable("connection refused".to_string()).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = agent_mesh_core::BusError::InvalidCursor {
            topic: "stream:c1".to_string(),
            cursor: "bogus".to_string(),
        }
        .into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
