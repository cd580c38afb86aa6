//! Canonical JSON serialization.
//!
//! Every digest in the system is computed over these bytes: object keys are
//! sorted recursively, no whitespace is emitted, and numbers use serde_json's
//! shortest round-trip formatting (no locale or platform dependence).

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Convert any serializable value into a `Value` with recursively sorted keys.
pub fn canonical_value<T: Serialize + ?Sized>(v: &T) -> Result<Value> {
    let value = serde_json::to_value(v)?;
    Ok(sort_keys(value))
}

/// Canonical byte serialization used for hashing and storage.
pub fn canonical_bytes<T: Serialize + ?Sized>(v: &T) -> Result<Vec<u8>> {
    let value = canonical_value(v)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Rebuild every object with its keys in ascending order.
///
/// The default serde_json map is already ordered, but a dependency enabling
/// `preserve_order` would silently switch it to insertion order; rebuilding
/// keeps the output stable either way.
pub fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut out = Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k, sort_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
