//! Digest functions for the audit chain.
//!
//! Payloads are hashed over a canonical JSON encoding (object keys sorted,
//! no insignificant whitespace) so the digest does not depend on map order.
//! Entry digests length-prefix every variable field.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Compute SHA256 hash of content.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Canonical JSON encoding of a value.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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

/// Digest of an event payload.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    compute_hash(canonical_json(payload).as_bytes())
}

/// Timestamp encoding used inside entry digests.
pub fn timestamp_repr(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Digest of `sequence ‖ timestamp ‖ actor ‖ action ‖ subject ‖ payload_hash ‖ previous_hash`.
pub fn entry_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    actor_id: &str,
    action: &str,
    subject_id: &str,
    payload_hash: &str,
    previous_hash: &str,
) -> String {
    let timestamp = timestamp_repr(timestamp);
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_be_bytes());
    for field in [
        timestamp.as_str(),
        actor_id,
        action,
        subject_id,
        payload_hash,
        previous_hash,
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}
