//! Field projection for outbound watch events.
//!
//! [`project`] is a pure function: it never fails and never mutates its
//! input. Every event loses `metadata.managedFields` (large, never useful to
//! a dashboard). When the subscriber asked for specific fields, the object is
//! further reduced to those dotted paths plus the identity fields.
//!
//! Payloads that are not shaped like an event (`{"type", "object"}`) or whose
//! object is not a JSON object pass through untouched.

use serde_json::{Map, Value};

/// Bookkeeping fields stripped from every object regardless of projection.
pub const STRIPPED_METADATA: &[&str] = &["managedFields"];

/// Fields kept on every projected object so the client can still identify it.
pub const IDENTITY_FIELDS: &[&str] = &[
    "apiVersion",
    "kind",
    "metadata.name",
    "metadata.namespace",
    "name",
    "namespace",
];

/// Project `event` onto `fields`, returning the reduced event and the number
/// of serialized bytes removed.
pub fn project(event: &Value, fields: &[String]) -> (Value, u64) {
    let Some(object) = event.get("object") else {
        return (event.clone(), 0);
    };

    let reduced = if let Some(items) = object.get("items").and_then(Value::as_array) {
        // List payload: project each element.
        let mut list = object.clone();
        list["items"] = Value::Array(items.iter().map(|i| reduce(i, fields)).collect());
        list
    } else {
        reduce(object, fields)
    };

    let removed = serialized_len(object).saturating_sub(serialized_len(&reduced));
    let mut out = event.clone();
    out["object"] = reduced;
    (out, removed)
}

/// Normalize a raw field list for keying: trim, drop empties, sort, dedup.
pub fn normalize_fields<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut fields: Vec<String> = raw
        .into_iter()
        .flat_map(|s| {
            s.as_ref()
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

fn reduce(object: &Value, fields: &[String]) -> Value {
    let Value::Object(map) = object else {
        return object.clone();
    };

    let mut stripped = map.clone();
    if let Some(Value::Object(metadata)) = stripped.get_mut("metadata") {
        for key in STRIPPED_METADATA {
            metadata.remove(*key);
        }
    }
    if fields.is_empty() {
        return Value::Object(stripped);
    }

    let source = Value::Object(stripped);
    let mut kept = Map::new();
    let paths = IDENTITY_FIELDS
        .iter()
        .copied()
        .chain(fields.iter().map(String::as_str));
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        if let Some(value) = lookup(&source, &segments) {
            insert(&mut kept, &segments, value.clone());
        }
    }
    Value::Object(kept)
}

fn lookup<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(value, |current, segment| current.as_object()?.get(*segment))
}

fn insert(target: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = target;
    for segment in parents {
        let entry = cursor
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(next) = entry else {
            // Parent is a scalar, nothing deeper to keep.
            return;
        };
        cursor = next;
    }
    cursor.insert((*last).to_string(), value);
}

fn serialized_len(value: &Value) -> u64 {
    serde_json::to_vec(value).map_or(0, |v| v.len() as u64)
}
