//! Health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, open WebSocket connections and the
/// configured upstream URL. Suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connections.load(Ordering::Relaxed),
        "max_connections": state.config.server.max_connections,
        "upstream": state.config.upstream.url,
    }))
}
