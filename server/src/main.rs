#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubedash
//!
//! Dashboard backend that multiplexes live cluster watches over one
//! WebSocket per browser tab.
//!
//! ## Subcommands
//!
//! - `kubedash serve` (default) — run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path          | Description                                   |
//! |--------|---------------|-----------------------------------------------|
//! | GET    | `/api/health` | Liveness probe                                |
//! | GET    | `/api/ws`     | WebSocket multiplexer for watch subscriptions |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! protocol.rs      — wire frames, composite keys
//! projection.rs    — managedFields stripping and field projection
//! stats.rs         — per-connection counters
//! upstream/
//!   mod.rs         — Upstream trait, watch events, resource paths
//!   cluster.rs     — HTTP client for the cluster API, NDJSON decoding
//! watch/
//!   registry.rs    — id → key → relay bookkeeping
//!   relay.rs       — direct watch and poll relays, fan-out
//!   poll.rs        — Helm release listings and snapshot diffing
//! ws/
//!   mod.rs         — upgrade, writer/keepalive/stats tasks, read loop
//!   connection.rs  — connection state machine, subscribe/unsubscribe
//! routes/
//!   health.rs      — GET /api/health
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use kubedash::upstream::cluster::ClusterClient;
use kubedash::{routes, AppState, Config};

/// Dashboard backend multiplexing cluster watches over WebSockets.
#[derive(Parser)]
#[command(name = "kubedash", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file (when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kubedash: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("kubedash v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Upstream: {}", config.upstream.url);
    if config.upstream.token.is_none() {
        warn!("No upstream token configured, relying on the proxy for auth");
    }

    let upstream = match ClusterClient::new(&config.upstream) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build upstream client: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState::new(config, upstream);
    let app = routes::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", state.config.server.listen);

    let shutdown_token = state.shutdown.clone();
    let shutdown = async move {
        wait_for_signal().await;
        // Live sockets never finish on their own; cancel them so the
        // graceful shutdown can complete.
        shutdown_token.cancel();
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }
    info!("Goodbye");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
