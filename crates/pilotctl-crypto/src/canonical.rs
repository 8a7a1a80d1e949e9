use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::CryptoError;

const INDENT: &str = "  ";

/// Produce the canonical byte form of a payload.
///
/// Rules:
/// - Object keys sorted lexicographically at every depth
/// - Two-space indentation, one member per line, `": "` after keys
/// - Empty arrays and objects rendered as `[]` and `{}`
/// - No HTML escaping of `<`, `>` or `&`
pub fn canonicalize<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, CryptoError> {
    let value =
        serde_json::to_value(payload).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    let mut out = String::new();
    write_value(&value, 0, &mut out)?;
    Ok(out.into_bytes())
}

/// SHA-256 over the canonical form.
pub fn checksum<T: Serialize + ?Sized>(payload: &T) -> Result<[u8; 32], CryptoError> {
    let canonical = canonicalize(payload)?;
    Ok(Sha256::digest(&canonical).into())
}

fn write_value(value: &Value, depth: usize, out: &mut String) -> Result<(), CryptoError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&quote(s)?),
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline(depth + 1, out);
                write_value(item, depth + 1, out)?;
            }
            newline(depth, out);
            out.push(']');
        }
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline(depth + 1, out);
                out.push_str(&quote(key)?);
                out.push_str(": ");
                write_value(val, depth + 1, out)?;
            }
            newline(depth, out);
            out.push('}');
        }
    }
    Ok(())
}

fn quote(s: &str) -> Result<String, CryptoError> {
    serde_json::to_string(s).map_err(|e| CryptoError::Serialization(e.to_string()))
}

fn newline(depth: usize, out: &mut String) {
    out.push('\n');
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}
