//! HTTP route handlers and the application router.

pub mod health;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{ws, AppState};

/// Build the full router: health probe plus the WebSocket multiplexer.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
