//! Canonical JSON encoding and hashing.
//!
//! Maps any serializable value to a byte-identical representation: object
//! keys sorted lexicographically, no whitespace, JSON string escaping,
//! numbers in serde_json's shortest round-trip form. The SHA-256 of the
//! UTF-8 bytes (lowercase hex) is the value's canonical hash, used for input
//! snapshots, dedupe comparisons, and policy-token signatures.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Replacement literal installed over redacted values.
pub const REDACTED_TOKEN: &str = "[REDACTED]";

/// A value that cannot be canonicalized (non-finite numbers, map keys that
/// are not strings).
#[derive(Debug, thiserror::Error)]
#[error("value cannot be canonicalized: {0}")]
pub struct CanonicalError(String);

/// Converts any serializable value into a `serde_json::Value` suitable for
/// canonical encoding. Non-finite floats surface here as `CanonicalError`.
pub fn to_canonical_value<T: Serialize>(value: &T) -> Result<Value, CanonicalError> {
    serde_json::to_value(value).map_err(|e| CanonicalError(e.to_string()))
}

/// Renders the canonical form: sorted keys, ordered arrays, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json handles JSON escaping; a string alone is valid JSON.
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of the canonical bytes, rendered lowercase hex.
pub fn canonical_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonicalizes and hashes in one step.
pub fn hash_value(value: &Value) -> String {
    canonical_hash(&canonical_json(value))
}

/// Lists every leaf path in the value as a dotted path with `[i]` array
/// indices. Empty containers contribute their own path.
pub fn extract_keys(value: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    walk_keys(value, String::new(), &mut keys);
    keys
}

fn walk_keys(value: &Value, path: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk_keys(child, child_path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                walk_keys(child, format!("{path}[{i}]"), out);
            }
        }
        _ => {
            if !path.is_empty() {
                out.push(path);
            }
        }
    }
}

/// Replaces the values at the given dotted key paths with [`REDACTED_TOKEN`],
/// in place, before canonicalization. A path segment applied to an array
/// descends into every element unless it carries an explicit `[i]` index.
/// Returns the subset of paths that matched.
pub fn redact_paths(value: &mut Value, paths: &[String]) -> Vec<String> {
    let mut applied = Vec::new();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        if redact_segments(value, &segments) {
            applied.push(path.clone());
        }
    }
    applied
}

fn redact_segments(value: &mut Value, segments: &[&str]) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        *value = Value::String(REDACTED_TOKEN.to_string());
        return true;
    };

    // "items[2]" addresses one element; "items" fans out over all of them.
    let (field, index) = match head.find('[') {
        Some(open) if head.ends_with(']') => {
            let idx = head[open + 1..head.len() - 1].parse::<usize>().ok();
            (&head[..open], idx)
        }
        _ => (*head, None),
    };

    match value {
        Value::Object(map) => {
            let Some(child) = map.get_mut(field) else {
                return false;
            };
            match (child, index) {
                (Value::Array(items), Some(i)) => items
                    .get_mut(i)
                    .map(|item| redact_segments(item, rest))
                    .unwrap_or(false),
                (Value::Array(items), None) if !rest.is_empty() => {
                    let mut any = false;
                    for item in items {
                        any |= redact_segments(item, rest);
                    }
                    any
                }
                (child, None) => redact_segments(child, rest),
                (_, Some(_)) => false,
            }
        }
        _ => false,
    }
}
