//! Wire format of the `/api/ws` multiplexer.
//!
//! ## Client → server
//!
//! ```json
//! { "id": "7", "action": "subscribe", "path": "/api/v1/pods", "params": { "fields": "status.phase" } }
//! { "id": "7", "action": "unsubscribe" }
//! ```
//!
//! `params.fields` is a comma-separated string or an array of strings. A
//! `fields=` entry inline in `path` counts as well. Every other param is
//! folded into the resource path's query.
//!
//! ## Server → client
//!
//! | `type`   | Fields                                                 |
//! |----------|--------------------------------------------------------|
//! | `ready`  | —                                                      |
//! | `status` | `id`, `path`, `data.type` = `subscribed`/`unsubscribed` |
//! | `data`   | `id`, `path`, `data` = projected watch event           |
//! | `error`  | `id?`, `path?`, `error`                                |
//! | `stats`  | `data` = counters + `interval_secs`                    |

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::projection::normalize_fields;
use crate::stats::StatsSnapshot;
use crate::upstream::{escape, ResourcePath};

/// Name of the projection parameter inside `params`.
pub const FIELDS_PARAM: &str = "fields";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

/// One client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub id: String,
    pub action: Action,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

/// A validated subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub id: String,
    pub path: ResourcePath,
    pub fields: Vec<String>,
}

impl SubscribeRequest {
    /// Composite key: the path alone, or `path?fields=a,b` with sorted fields.
    pub fn key(&self) -> String {
        composite_key(&self.path, &self.fields)
    }
}

/// Composite key for a path and a normalized field list. The path's query
/// never carries `fields` itself, so the trailing `fields=` is unambiguous.
pub fn composite_key(path: &ResourcePath, fields: &[String]) -> String {
    if fields.is_empty() {
        return path.to_string();
    }
    let sep = if path.query().is_empty() { '?' } else { '&' };
    let fields: Vec<_> = fields.iter().map(|f| escape(f, &[])).collect();
    format!("{path}{sep}{FIELDS_PARAM}={}", fields.join(","))
}

/// Why a client frame was rejected. Carries whatever id/path could be
/// salvaged so the error can be routed.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct ProtocolError {
    pub id: Option<String>,
    pub path: Option<String>,
    pub reason: String,
}

impl ProtocolError {
    fn new(raw: Option<&Value>, reason: impl Into<String>) -> Self {
        let pick = |field: &str| {
            raw.and_then(|v| v[field].as_str())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        Self {
            id: pick("id"),
            path: pick("path"),
            reason: reason.into(),
        }
    }
}

/// Parse one text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::new(None, format!("invalid JSON: {e}")))?;
    serde_json::from_value::<ClientMessage>(raw.clone())
        .map_err(|e| ProtocolError::new(Some(&raw), format!("invalid message: {e}")))
}

impl ClientMessage {
    /// Validate a `subscribe` frame.
    pub fn subscribe_request(&self) -> Result<SubscribeRequest, ProtocolError> {
        if self.id.is_empty() {
            return Err(self.reject("missing subscription id"));
        }
        let (path, fields) = self.target()?;
        Ok(SubscribeRequest {
            id: self.id.clone(),
            path,
            fields,
        })
    }

    /// Composite key named by `path` + `params`, for path-only unsubscribes.
    pub fn path_key(&self) -> Result<String, ProtocolError> {
        let (path, fields) = self.target()?;
        Ok(composite_key(&path, &fields))
    }

    /// Resource path plus normalized fields. `fields` is accepted in
    /// `params` or inline in the path's query; both feed the projection and
    /// neither reaches the upstream request.
    fn target(&self) -> Result<(ResourcePath, Vec<String>), ProtocolError> {
        if self.path.is_empty() {
            return Err(self.reject("missing path"));
        }
        let mut path = ResourcePath::with_params(&self.path, self.params.as_ref(), FIELDS_PARAM);
        let inline = path.remove_query(FIELDS_PARAM);
        let mut names: Vec<&str> = inline.as_deref().into_iter().collect();
        match self.params.as_ref().and_then(|p| p.get(FIELDS_PARAM)) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => names.push(s),
            Some(Value::Array(items)) => {
                for item in items {
                    let Some(s) = item.as_str() else {
                        return Err(self.reject("fields must be strings"));
                    };
                    names.push(s);
                }
            }
            Some(_) => return Err(self.reject("fields must be a string or an array of strings")),
        }
        Ok((path, normalize_fields(names)))
    }

    fn reject(&self, reason: &str) -> ProtocolError {
        ProtocolError::new(Some(&json!({"id": self.id, "path": self.path})), reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Ready,
    Data,
    Error,
    Status,
    Stats,
}

/// One server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    fn bare(kind: MessageType) -> Self {
        Self {
            id: None,
            kind,
            path: None,
            data: None,
            error: None,
        }
    }

    pub fn ready() -> Self {
        Self::bare(MessageType::Ready)
    }

    pub fn data(id: &str, path: &str, event: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            path: Some(path.to_string()),
            data: Some(event),
            ..Self::bare(MessageType::Data)
        }
    }

    pub fn status(id: &str, path: &str, status: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            path: Some(path.to_string()),
            data: Some(json!({ "type": status })),
            ..Self::bare(MessageType::Status)
        }
    }

    pub fn error(id: Option<&str>, path: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            id: id.map(ToString::to_string),
            path: path.map(ToString::to_string),
            error: Some(message.into()),
            ..Self::bare(MessageType::Error)
        }
    }

    pub fn stats(snapshot: StatsSnapshot, interval_secs: f64) -> Self {
        Self {
            data: Some(json!({
                "objects_sent": snapshot.objects_sent,
                "bytes_removed": snapshot.bytes_removed,
                "bytes_sent": snapshot.bytes_sent,
                "interval_secs": interval_secs,
            })),
            ..Self::bare(MessageType::Stats)
        }
    }

    /// `status` message value, if this is a status frame.
    pub fn status_type(&self) -> Option<&str> {
        if self.kind != MessageType::Status {
            return None;
        }
        self.data.as_ref()?["type"].as_str()
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(e: ProtocolError) -> Self {
        ServerMessage::error(e.id.as_deref(), e.path.as_deref(), e.reason)
    }
}
