//! HTTP route handlers.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Plain-text liveness line |
//! | `GET` | `/getpublickey` | Server public key, hex (no auth) |
//! | `GET` | `/protocol` | `{"protocol": "ws://" \| "wss://"}`, sealed |
//!
//! The WebSocket upgrade lives in [`crate::ws`].

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::crypto::Envelope;
use crate::error::FilterError;
use crate::state::AppState;

/// Liveness line with the number of live connections.
pub async fn index(State(state): State<Arc<AppState>>) -> String {
    format!(
        "engine server: {} connection(s)\n",
        state.registry.connection_count()
    )
}

/// The server's long-term public key as a hex JSON string.
pub async fn get_public_key(State(state): State<Arc<AppState>>) -> Json<String> {
    debug!("public key requested");
    Json(state.keys.public_key_hex())
}

/// The WebSocket scheme to connect with, sealed for the requesting client.
///
/// In box mode the body is the sealed JSON object as a JSON string; with a
/// shared secret it is the plain object.
pub async fn protocol(
    State(state): State<Arc<AppState>>,
    Extension(envelope): Extension<Arc<Envelope>>,
) -> Result<Response, FilterError> {
    let body = serde_json::json!({ "protocol": state.protocol() });

    Ok(match envelope.as_ref() {
        Envelope::Boxed(mailbox) => Json(mailbox.seal(&body)?).into_response(),
        Envelope::Plain => Json(body).into_response(),
    })
}
