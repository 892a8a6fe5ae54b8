//! Polling-emulated watches for Helm releases.
//!
//! Helm has no watch API. Its release records live in storage secrets
//! labelled `owner=helm`, `name`, `status` and `version`, so a synthetic
//! path is served by listing those secrets on an interval and diffing
//! successive snapshots by identity key.
//!
//! Synthetic paths:
//!
//! | Path                                             | Identity         |
//! |--------------------------------------------------|------------------|
//! | `/helm/releases`                                 | `namespace/name` |
//! | `/helm/namespaces/{ns}/releases`                 | `namespace/name` |
//! | `/helm/namespaces/{ns}/releases/{name}/history`  | revision         |

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value};

use crate::upstream::{EventKind, ResourcePath, WatchEvent};

const HELM_OWNER_SELECTOR: &str = "owner=helm";

/// A synthetic Helm path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    /// Latest revision of every release, optionally in one namespace.
    Releases { namespace: Option<String> },
    /// Every stored revision of one release.
    History { namespace: String, name: String },
}

impl PollTarget {
    /// Match `path` against the synthetic Helm paths. Query parameters are
    /// ignored.
    pub fn parse(path: &ResourcePath) -> Option<Self> {
        let segments: Vec<&str> = path
            .path()
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        match segments.as_slice() {
            ["helm", "releases"] => Some(Self::Releases { namespace: None }),
            ["helm", "namespaces", ns, "releases"] => Some(Self::Releases {
                namespace: Some((*ns).to_string()),
            }),
            ["helm", "namespaces", ns, "releases", name, "history"] => Some(Self::History {
                namespace: (*ns).to_string(),
                name: (*name).to_string(),
            }),
            _ => None,
        }
    }

    /// The cluster listing that backs this target.
    pub fn source(&self) -> ResourcePath {
        match self {
            Self::Releases { namespace: None } => ResourcePath::new("/api/v1/secrets")
                .with_query("labelSelector", HELM_OWNER_SELECTOR),
            Self::Releases {
                namespace: Some(ns),
            } => ResourcePath::new(&format!("/api/v1/namespaces/{ns}/secrets"))
                .with_query("labelSelector", HELM_OWNER_SELECTOR),
            Self::History { namespace, name } => {
                ResourcePath::new(&format!("/api/v1/namespaces/{namespace}/secrets"))
                    .with_query("labelSelector", &format!("{HELM_OWNER_SELECTOR},name={name}"))
            }
        }
    }

    /// Reduce a secrets listing to the items this target reports, in a
    /// stable order.
    pub fn items(&self, listing: &Value) -> Vec<Value> {
        let records = listing["items"]
            .as_array()
            .map(|items| items.iter().filter_map(release_record).collect::<Vec<_>>())
            .unwrap_or_default();

        match self {
            Self::Releases { .. } => {
                let mut latest: BTreeMap<(String, String), ReleaseRecord> = BTreeMap::new();
                for record in records {
                    let key = (record.namespace.clone(), record.name.clone());
                    let newer = latest
                        .get(&key)
                        .map_or(true, |existing| record.revision > existing.revision);
                    if newer {
                        latest.insert(key, record);
                    }
                }
                latest.into_values().map(ReleaseRecord::into_value).collect()
            }
            Self::History { namespace, name } => {
                let mut history: Vec<ReleaseRecord> = records
                    .into_iter()
                    .filter(|r| &r.namespace == namespace && &r.name == name)
                    .collect();
                history.sort_by_key(|r| r.revision);
                history.into_iter().map(ReleaseRecord::into_value).collect()
            }
        }
    }

    /// Identity key of one reported item.
    pub fn identity(&self, item: &Value) -> String {
        match self {
            Self::Releases { .. } => format!(
                "{}/{}",
                item["namespace"].as_str().unwrap_or_default(),
                item["name"].as_str().unwrap_or_default()
            ),
            Self::History { .. } => item["revision"].to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ReleaseRecord {
    name: String,
    namespace: String,
    revision: u64,
    status: String,
    updated: Value,
}

impl ReleaseRecord {
    fn into_value(self) -> Value {
        json!({
            "name": self.name,
            "namespace": self.namespace,
            "revision": self.revision,
            "status": self.status,
            "updated": self.updated,
        })
    }
}

fn release_record(secret: &Value) -> Option<ReleaseRecord> {
    let metadata = &secret["metadata"];
    let labels = &metadata["labels"];
    if labels["owner"].as_str() != Some("helm") {
        return None;
    }
    Some(ReleaseRecord {
        name: labels["name"].as_str()?.to_string(),
        namespace: metadata["namespace"].as_str().unwrap_or_default().to_string(),
        revision: labels["version"].as_str()?.parse().ok()?,
        status: labels["status"].as_str().unwrap_or("unknown").to_string(),
        updated: labels
            .get("modifiedAt")
            .or_else(|| metadata.get("creationTimestamp"))
            .cloned()
            .unwrap_or(Value::Null),
    })
}

/// Diff two snapshots by identity key.
///
/// Deletions come first in `previous` order, then additions and
/// modifications in `current` order. Unchanged items emit nothing.
pub fn diff<F>(previous: &[Value], current: &[Value], identity: F) -> Vec<WatchEvent>
where
    F: Fn(&Value) -> String,
{
    let before: HashMap<String, &Value> = previous.iter().map(|v| (identity(v), v)).collect();
    let after: HashMap<String, &Value> = current.iter().map(|v| (identity(v), v)).collect();

    let mut events = Vec::new();
    for item in previous {
        if !after.contains_key(&identity(item)) {
            events.push(WatchEvent::new(EventKind::Deleted, item.clone()));
        }
    }
    for item in current {
        match before.get(&identity(item)) {
            None => events.push(WatchEvent::new(EventKind::Added, item.clone())),
            Some(old) if *old != item => {
                events.push(WatchEvent::new(EventKind::Modified, item.clone()));
            }
            Some(_) => {}
        }
    }
    events
}
