//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `KUBEDASH_LISTEN`, `KUBEDASH_UPSTREAM_URL`,
//!    `KUBEDASH_UPSTREAM_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `kubedash.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9090"
//! max_connections = 64
//!
//! [upstream]
//! url = "http://127.0.0.1:8001"   # e.g. `kubectl proxy`
//! token = "..."                   # optional bearer token
//! connect_timeout_secs = 10
//!
//! [watch]
//! poll_interval_ms = 2000         # polling-emulated watches (Helm)
//! poll_failure_limit = 5
//! rewatch_delay_ms = 1000         # pause before re-opening an ended watch
//!
//! [ws]
//! stats_interval_ms = 1000
//! ping_interval_secs = 30
//! outbound_buffer = 256
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:9090`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent WebSocket connections (default 64). Upgrades past
    /// this limit are rejected with 503.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Cluster API endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the cluster API. Override with `KUBEDASH_UPSTREAM_URL`.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Optional bearer token. Override with `KUBEDASH_UPSTREAM_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
    /// TCP connect timeout in seconds (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for snapshot fetches in seconds (default 30).
    /// Watches are long-lived and never time out.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Watch relay tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Interval between snapshots for polling-emulated watches (default 2000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive failed polls before the relay gives up (default 5).
    #[serde(default = "default_poll_failure_limit")]
    pub poll_failure_limit: u32,
    /// Pause before re-opening a direct watch the cluster ended (default 1000).
    #[serde(default = "default_rewatch_delay_ms")]
    pub rewatch_delay_ms: u64,
}

/// Per-connection WebSocket settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    /// Interval between `stats` messages in milliseconds (default 1000).
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Seconds between server-initiated pings (default 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Capacity of the per-connection outbound queue (default 256).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_max_connections() -> u32 {
    64
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:8001".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_poll_failure_limit() -> u32 {
    5
}
fn default_rewatch_delay_ms() -> u64 {
    1000
}
fn default_stats_interval_ms() -> u64 {
    1000
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            token: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_failure_limit: default_poll_failure_limit(),
            rewatch_delay_ms: default_rewatch_delay_ms(),
        }
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: default_stats_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn rewatch_delay(&self) -> Duration {
        Duration::from_millis(self.rewatch_delay_ms)
    }
}

impl WsConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `kubedash.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("kubedash.toml").exists() {
            Self::from_file(Path::new("kubedash.toml"))?
        } else {
            Config::default()
        };

        if let Ok(listen) = std::env::var("KUBEDASH_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("KUBEDASH_UPSTREAM_URL") {
            config.upstream.url = url;
        }
        if let Ok(token) = std::env::var("KUBEDASH_UPSTREAM_TOKEN") {
            config.upstream.token = Some(token);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9090");
        assert_eq!(config.watch.poll_interval_ms, 2000);
        assert_eq!(config.ws.stats_interval_ms, 1000);
        assert_eq!(config.ws.outbound_buffer, 256);
        assert!(config.upstream.token.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            url = "https://cluster.example:6443"
            token = "abc"

            [watch]
            poll_interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream.url, "https://cluster.example:6443");
        assert_eq!(config.upstream.token.as_deref(), Some("abc"));
        assert_eq!(config.upstream.connect_timeout_secs, 10);
        assert_eq!(config.watch.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.watch.poll_failure_limit, 5);
        assert_eq!(config.watch.rewatch_delay(), Duration::from_secs(1));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/kubedash.toml")).unwrap_err();
        assert!(err.contains("Failed to read config file"));
    }
}
