//! Error types for the HTTP boundary, the wire protocol and user handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Crate-level errors surfaced at the HTTP boundary.
#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No live view mounted at {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Pub/sub error: {0}")]
    PubSub(#[from] PubSubError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] ViewError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for LiveError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            LiveError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            LiveError::Session(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            LiveError::Serialization(e) => {
                (StatusCode::BAD_REQUEST, format!("Invalid payload: {}", e))
            }
            LiveError::NotFound(path) => {
                (StatusCode::NOT_FOUND, format!("No live view at {}", path))
            }
            LiveError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            LiveError::PubSub(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            LiveError::Lifecycle(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("View failed: {}", e),
            ),
            LiveError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

pub type LiveResult<T> = Result<T, LiveError>;

/// Failure raised by a user handler (`mount`, `handle_event`, `render`, ...).
/// This is the only error class that terminates a connection.
#[derive(Error, Debug)]
pub enum ViewError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ViewError {
    pub fn msg(message: impl Into<String>) -> Self {
        ViewError::Message(message.into())
    }
}

pub type ViewResult<T> = Result<T, ViewError>;

/// Rejected inbound frame. Answered with an `error` frame; the connection stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("unknown event {0}")]
    UnknownEvent(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid session: {0}")]
    InvalidSession(String),

    #[error("csrf token mismatch")]
    InvalidCsrf,

    #[error("no live view mounted at {0}")]
    UnknownView(String),

    #[error("view has no {0} handler")]
    NoHandler(&'static str),
}

impl ProtocolError {
    /// Stable reason code carried in the `error` frame payload.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::MalformedFrame(_) => "malformed_frame",
            ProtocolError::UnknownTopic(_) => "unknown_topic",
            ProtocolError::UnknownEvent(_) => "unknown_event",
            ProtocolError::InvalidPayload(_) => "invalid_payload",
            ProtocolError::InvalidSession(_) => "invalid_session",
            ProtocolError::InvalidCsrf => "invalid_csrf",
            ProtocolError::UnknownView(_) => "unknown_view",
            ProtocolError::NoHandler(_) => "no_handler",
        }
    }
}

/// Outbound frame could not be handed to the socket writer.
#[derive(Error, Debug, Clone)]
#[error("failed to send {event} on {topic}: {reason}")]
pub struct TransportError {
    pub topic: String,
    pub event: String,
    pub reason: String,
}

/// Pub/sub backend failure.
#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_codes_are_stable() {
        assert_eq!(ProtocolError::InvalidCsrf.code(), "invalid_csrf");
        assert_eq!(
            ProtocolError::UnknownTopic("lv:1".to_string()).code(),
            "unknown_topic"
        );
        assert_eq!(ProtocolError::NoHandler("event").code(), "no_handler");
    }

    #[test]
    fn not_found_maps_to_404() {
        let res = LiveError::NotFound("/missing".to_string()).into_response();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
