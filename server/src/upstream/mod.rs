//! Upstream collaborators: the cluster API as seen by watch relays.
//!
//! Relays never talk HTTP directly. They go through the [`Upstream`] trait,
//! which offers exactly two operations:
//!
//! - **snapshot** — `GET` the current listing for a resource path
//! - **watch** — open a cancellable stream of add/modify/delete events
//!
//! [`cluster::ClusterClient`] is the production implementation. Tests swap
//! in an in-memory double that counts watch opens and closes.

pub mod cluster;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Stream of watch events. Dropping it closes the upstream watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, UpstreamError>>;

/// Source of snapshots and live watches for resource paths.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch the current listing for `path`.
    async fn snapshot(&self, path: &ResourcePath) -> Result<Value, UpstreamError>;

    /// Open a live watch on `path`.
    async fn watch(&self, path: &ResourcePath) -> Result<WatchStream, UpstreamError>;
}

/// Errors raised by an [`Upstream`].
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport failure (connection refused, timeout, body read error).
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The cluster answered with a non-2xx status.
    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// The response body was not the JSON we expected.
    #[error("invalid upstream payload: {0}")]
    Decode(#[from] serde_json::Error),
    /// The watch itself reported an error event.
    #[error("upstream watch error: {0}")]
    Watch(String),
}

/// Watch event type, in the cluster's wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
        }
    }
}

/// One watch event: `{"type": "ADDED", "object": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub object: Value,
}

impl WatchEvent {
    pub fn new(kind: EventKind, object: Value) -> Self {
        Self { kind, object }
    }

    /// Wire form, ready for projection.
    pub fn into_value(self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.kind.as_str().to_string()));
        map.insert("object".to_string(), self.object);
        Value::Object(map)
    }

    /// Human-readable message carried by an `ERROR` event's Status object.
    pub fn error_message(&self) -> String {
        self.object["message"]
            .as_str()
            .map_or_else(|| self.object.to_string(), ToString::to_string)
    }
}

/// What to watch: a path plus a canonical (sorted) query.
///
/// The query is kept literal. Values are encoded by the HTTP client when the
/// request is built, so selectors should be passed unencoded. The display
/// form escapes `%` and `&` in keys and values (and `=` in keys), so two
/// different queries never render the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourcePath {
    path: String,
    query: BTreeMap<String, String>,
}

impl ResourcePath {
    /// Parse a path that may carry an inline `?k=v&k2=v2` query.
    pub fn new(raw: &str) -> Self {
        let (path, query) = match raw.split_once('?') {
            Some((p, q)) => (p, q),
            None => (raw, ""),
        };
        let mut parsed = Self {
            path: path.to_string(),
            query: BTreeMap::new(),
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            parsed.query.insert(k.to_string(), v.to_string());
        }
        parsed
    }

    /// Parse `raw` and fold every entry of `params` except `skip` into the
    /// query. Non-string values are rendered as JSON.
    pub fn with_params(raw: &str, params: Option<&Map<String, Value>>, skip: &str) -> Self {
        let mut parsed = Self::new(raw);
        for (k, v) in params.into_iter().flatten() {
            if k == skip {
                continue;
            }
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parsed.query.insert(k.clone(), value);
        }
        parsed
    }

    #[must_use]
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    /// Take `key` out of the query.
    pub fn remove_query(&mut self, key: &str) -> Option<String> {
        self.query.remove(key)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for (i, (k, v)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{}={}", escape(k, &['=']), escape(v, &[]))?;
        }
        Ok(())
    }
}

/// Percent-escape `%`, `&` and any of `extra` in one query component.
pub(crate) fn escape<'a>(raw: &'a str, extra: &[char]) -> Cow<'a, str> {
    let reserved = |c: char| c == '%' || c == '&' || extra.contains(&c);
    if !raw.contains(reserved) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        if reserved(c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}
