//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::upstream::Upstream;

/// Read-only state shared by every connection.
///
/// Connections own their registries; nothing subscription-related lives
/// here.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Cluster API client shared by all relays.
    pub upstream: Arc<dyn Upstream>,
    /// Current number of open WebSocket connections.
    pub connections: Arc<AtomicU32>,
    /// Cancelled on shutdown; every connection holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            upstream,
            connections: Arc::new(AtomicU32::new(0)),
            shutdown: CancellationToken::new(),
        }
    }
}
