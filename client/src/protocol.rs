//! Frames exchanged with the kubedash `/api/ws` endpoint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

/// Client → server frame.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMessage {
    pub id: String,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl ClientMessage {
    pub fn subscribe(id: &str, path: &str, params: Option<Map<String, Value>>) -> Self {
        Self {
            id: id.to_string(),
            action: Action::Subscribe,
            path: Some(path.to_string()),
            params,
        }
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self {
            id: id.to_string(),
            action: Action::Unsubscribe,
            path: None,
            params: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Ready,
    Data,
    Error,
    Status,
    Stats,
    #[serde(other)]
    Unknown,
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}
