//! Utility functions and helpers.

pub mod url;

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix marking a resource id derived from content rather than the source.
pub const HASH_ID_PREFIX: &str = "h:";

/// Stable content hash of a JSON node.
///
/// Object keys are serialized in sorted order so the hash does not depend on
/// the order in which the source emitted them.
pub fn content_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{HASH_ID_PREFIX}{}", &hex::encode(digest)[..32])
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Random delay within `[min_ms, max_ms]`.
pub fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(fastrand::u64(min_ms..=max_ms))
}

/// Sleep for a jittered delay. A zero band returns immediately.
pub async fn pause(min_ms: u64, max_ms: u64) {
    let delay = jitter(min_ms, max_ms);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
