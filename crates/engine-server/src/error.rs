//! Error types for the engine server.
//!
//! [`ServerError`] is what the owning application sees: invalid lifecycle
//! transitions and fatal transport failures. [`FilterError`] covers request
//! rejections and converts into an Axum HTTP response via its
//! [`IntoResponse`] implementation. Per-frame, per-send and listener
//! failures never surface as errors; they are logged where they happen.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::crypto::CryptoError;

/// Errors surfaced by the server lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `start` was called while the server was not stopped.
    #[error("invalid state transition: server is already running")]
    AlreadyRunning,

    /// `stop` was called while the server was not running.
    #[error("invalid state transition: server is not running")]
    NotRunning,

    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// Failed to load TLS certificate or key material.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Failed to build the event loop or its thread.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The server failed while accepting connections.
    #[error("serve error: {0}")]
    Serve(String),

    /// The background thread panicked.
    #[error("server thread panicked")]
    ThreadPanicked,

    /// `join` was called from the server's own event-loop thread.
    #[error("cannot join the server thread from its own event loop")]
    JoinFromLoopThread,
}

/// Errors that reject a request before or inside a route handler.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The request's `Origin` matched none of the allowed patterns.
    #[error("origin not allowed")]
    OriginDenied,

    /// Credentials were missing or did not verify.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Sealing a response failed.
    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),
}

impl IntoResponse for FilterError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // No body: a denied origin learns nothing about the server.
            Self::OriginDenied => return StatusCode::FORBIDDEN.into_response(),
            Self::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason.clone()),
            Self::Crypto(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to seal response".to_owned(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
