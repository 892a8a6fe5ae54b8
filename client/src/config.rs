//! Command-line configuration for `kubedash-watch`.
//!
//! The server is given as an HTTP(S) or WS(S) base URL; the WebSocket
//! endpoint is derived from it. Every `--path` becomes one subscription,
//! all sharing the same `--fields` projection and `--selector`.

use std::time::Duration;

use clap::Parser;
use serde_json::{Map, Value};

use kubedash_client::ReconnectPolicy;

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(name = "kubedash-watch", about = "Stream cluster watches from a kubedash server", version)]
pub struct Cli {
    /// Server base URL (http://, https://, ws:// or wss://)
    #[arg(long, default_value = "http://127.0.0.1:9090")]
    pub url: String,
    /// Resource path to watch; repeat for several subscriptions
    #[arg(long = "path", required = true)]
    pub paths: Vec<String>,
    /// Comma-separated dotted fields to keep on every object
    #[arg(long)]
    pub fields: Option<String>,
    /// Label selector passed through to the cluster
    #[arg(long)]
    pub selector: Option<String>,
    /// Print each event as raw JSON instead of a summary line
    #[arg(long)]
    pub json: bool,
    /// Backoff ceiling in seconds
    #[arg(long, default_value_t = 30)]
    pub max_backoff_secs: u64,
}

impl Cli {
    /// `params` object shared by every subscription.
    pub fn params(&self) -> Option<Map<String, Value>> {
        let mut params = Map::new();
        if let Some(fields) = &self.fields {
            params.insert("fields".to_string(), Value::String(fields.clone()));
        }
        if let Some(selector) = &self.selector {
            params.insert("labelSelector".to_string(), Value::String(selector.clone()));
        }
        (!params.is_empty()).then_some(params)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max: Duration::from_secs(self.max_backoff_secs.max(1)),
            ..ReconnectPolicy::default()
        }
    }
}

/// Build the WebSocket URL from the server base URL.
pub fn build_ws_url(base_url: &str) -> Result<String, String> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(format!("Invalid URL scheme: {base}"));
    };
    if ws_base.ends_with("/api/ws") {
        Ok(ws_base)
    } else {
        Ok(format!("{ws_base}/api/ws"))
    }
}
