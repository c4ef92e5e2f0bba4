//! Field-level comparison of desired and observed objects.
//!
//! The comparison is a subset check: every field the operator sets must be
//! present and equal in the observed object, while fields only the observed
//! object carries (server defaults, status, bookkeeping metadata) are ignored.
//! An empty result means the object is converged and must not be written.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::controller::error::Result;

/// JSON paths of the desired fields that differ from the observed object.
pub fn changed_paths(desired: &Value, observed: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect(desired, observed, "", &mut paths);
    paths
}

/// [`changed_paths`] for any serializable object.
pub fn object_diff<K: Serialize>(desired: &K, observed: &K) -> Result<Vec<String>> {
    Ok(changed_paths(
        &serde_json::to_value(desired)?,
        &serde_json::to_value(observed)?,
    ))
}

fn collect(desired: &Value, observed: &Value, path: &str, out: &mut Vec<String>) {
    match (desired, observed) {
        (Value::Null, _) => {}
        (Value::Object(want), Value::Object(have)) => {
            for (key, value) in want {
                let child = format!("{path}/{key}");
                match have.get(key) {
                    Some(actual) => collect(value, actual, &child, out),
                    None if is_empty(value) => {}
                    None => out.push(child),
                }
            }
        }
        (Value::Object(want), Value::Null) if want.is_empty() => {}
        (Value::Array(want), Value::Array(have)) => {
            if want.len() != have.len() {
                out.push(path.to_string());
                return;
            }
            for (idx, (value, actual)) in want.iter().zip(have).enumerate() {
                collect(value, actual, &format!("{path}/{idx}"), out);
            }
        }
        (want, have) if want == have => {}
        _ => out.push(if path.is_empty() { "/".to_string() } else { path.to_string() }),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.values().all(is_empty),
        _ => false,
    }
}

/// Lay `desired` over `observed`: objects merge key by key, everything else
/// is taken from `desired`. Fields only present in `observed` survive.
pub fn overlay(observed: &Value, desired: &Value) -> Value {
    match (observed, desired) {
        (Value::Object(base), Value::Object(top)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in top {
                if value.is_null() {
                    continue;
                }
                let next = match base.get(key) {
                    Some(existing) => overlay(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, Value::Null) => observed.clone(),
        (_, top) => top.clone(),
    }
}

/// The object to write so that `observed` converges on `desired`,
/// keeping the observed resourceVersion for optimistic concurrency.
pub fn merged_object<K>(desired: &K, observed: &K) -> Result<K>
where
    K: Serialize + serde::de::DeserializeOwned,
{
    let merged = overlay(&serde_json::to_value(observed)?, &serde_json::to_value(desired)?);
    Ok(serde_json::from_value(merged)?)
}
