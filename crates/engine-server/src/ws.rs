//! WebSocket session handling.
//!
//! Clients connect to `GET /websocket` after passing the filter chain.
//! Each session is registered with the connection registry for as long as
//! its receive loop runs. Text frames are opened with the session's
//! envelope; frames that fail to open are logged and dropped without
//! closing the session. The `"close"` sentinel closes the session without
//! waiting for the peer to acknowledge, and any other payload is written to
//! the inbound message cell.

use std::ops::ControlFlow;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Extension, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use engine_server_types::{ConnectionId, InboundFrame, ReceivedMessage};
use futures::StreamExt as _;
use tracing::{debug, info};

use crate::crypto::Envelope;
use crate::registry::{Connection, NORMAL_CLOSURE};
use crate::state::AppState;

/// Upgrade to a WebSocket session.
///
/// # Route
///
/// `GET /websocket`
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(envelope): Extension<Arc<Envelope>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, envelope))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, envelope: Arc<Envelope>) {
    if state.is_shutting_down() {
        debug!("server shutting down, dropping new session");
        return;
    }

    let id = ConnectionId::new();
    let (sink, mut stream) = socket.split();
    let registration = state.registry.enroll(Connection::new(id, sink, envelope));
    let connection = registration.connection().clone();
    let mut shutdown = state.shutdown.clone();
    info!(connection = %id, encrypted = connection.envelope().is_encrypted(), "WebSocket connection ready");

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(&state, &connection, text.as_str()).await.is_break() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!(connection = %id, error = %e, "WebSocket connection closed with error");
                    break;
                }
            },
            // Shutdown (or the server dropping its sender) ends the session.
            () = async { drop(shutdown.wait_for(|stopping| *stopping).await) } => break,
        }
    }

    connection.close(NORMAL_CLOSURE, "").await;
    drop(registration);
    info!(connection = %id, "WebSocket connection closed");
}

async fn handle_text(state: &AppState, connection: &Connection, text: &str) -> ControlFlow<()> {
    let payload = match connection.envelope().open(text) {
        Ok(payload) => payload,
        Err(e) => {
            info!(connection = %connection.id(), error = %e, "dropping frame that failed to open");
            return ControlFlow::Continue(());
        }
    };

    match InboundFrame::classify(payload) {
        InboundFrame::Close => {
            debug!(connection = %connection.id(), "client asked to close");
            connection.close(NORMAL_CLOSURE, "").await;
            ControlFlow::Break(())
        }
        InboundFrame::Payload(payload) => {
            debug!(connection = %connection.id(), "message received");
            state.messages.write(Some(ReceivedMessage {
                connection: connection.id(),
                payload,
            }));
            ControlFlow::Continue(())
        }
    }
}
