//! Axum router construction.
//!
//! Assembles the HTTP and WebSocket routes behind the filter chain.

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::filter;
use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete router for one running server.
///
/// The router includes:
/// - `GET /` -- liveness text
/// - `GET /getpublickey` -- server public key (no authentication)
/// - `GET /protocol` -- `ws://` or `wss://`
/// - `GET /websocket` -- WebSocket upgrade
///
/// Requests pass the trace span, the origin check, CORS, then
/// authentication, in that order.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route(filter::PUBLIC_KEY_PATH, get(handlers::get_public_key))
        .route("/protocol", get(handlers::protocol))
        .route("/websocket", get(ws::websocket_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            filter::authenticate,
        ))
        .layer(filter::cors_layer(Arc::clone(&state.origins)))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            filter::check_origin,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
