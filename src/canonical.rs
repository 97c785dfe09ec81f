//! Canonical JSON (RFC 8785 subset) and `sha256:<hex>` digests.
//!
//! Object keys are emitted in lexicographic order with compact separators,
//! strings are UTF-8, and a negative zero is written as `0`. Every hash in
//! the event log, witness envelope and meshpack manifest is computed over
//! this form.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize any value into canonical bytes.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out.into_bytes())
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => {
            out.push_str(&serde_json::to_string(value)?);
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 && f.is_sign_negative() => out.push('0'),
            _ => out.push_str(&n.to_string()),
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
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
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// `sha256:<hex>` of raw bytes.
pub fn sha256_tagged(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Strip the `sha256:` tag, leaving the hex digest.
pub fn digest_hex(tagged: &str) -> &str {
    tagged.strip_prefix("sha256:").unwrap_or(tagged)
}

/// Deterministic fingerprint of a file list: `(count, sha256 of sorted
/// non-empty paths joined by NUL)`.
pub fn files_fingerprint(files: &[String]) -> (usize, String) {
    let mut normalized: Vec<&str> = files
        .iter()
        .map(String::as_str)
        .filter(|f| !f.is_empty())
        .collect();
    normalized.sort_unstable();
    let joined = normalized.join("\0");
    (normalized.len(), sha256_tagged(joined.as_bytes()))
}
