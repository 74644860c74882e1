//! Dotted-path access into JSON variable trees
//!
//! Session, bot and message variables are plain `serde_json::Value` objects.
//! Paths look like `session.profile.name` or `message.items.0.id`; numeric
//! segments index into arrays.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Suffix on a target path that appends to a list instead of overwriting
pub const APPEND_SUFFIX: &str = "|a";

/// Look up a dotted path
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate objects.
///
/// A path ending in `|a` appends `value` to the list found there (a scalar
/// already stored there becomes the first element).
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let (path, append) = match path.strip_suffix(APPEND_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (path, false),
    };

    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    let Value::Object(map) = current else {
        return;
    };

    if append {
        let slot = map
            .entry(last.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(value),
            Value::Null => *slot = Value::Array(vec![value]),
            other => {
                let previous = other.take();
                *other = Value::Array(vec![previous, value]);
            }
        }
    } else {
        map.insert(last.to_string(), value);
    }
}

/// Apply `source path -> target path` save mappings.
///
/// Sources are read from `context`; targets are written into `target`.
/// Missing sources are skipped. Returns how many values were written.
pub fn apply_mappings(
    mappings: &BTreeMap<String, String>,
    context: &Value,
    target: &mut Value,
) -> usize {
    let mut written = 0;
    for (source, destination) in mappings {
        if let Some(value) = get_path(context, source) {
            set_path(target, destination, value.clone());
            written += 1;
        } else {
            tracing::debug!(source = %source, "Variable mapping source missing; skipped");
        }
    }
    written
}
