//! Normalization of binary identity frames (`idents`).
//!
//! By the time an envelope reaches the bridge its identity frames may have
//! been through several serialization hops, each leaving its own encoding of
//! "some bytes". Every recognized shape is collapsed to a plain JSON array of
//! byte values; anything else is left alone.

use serde_json::{Map, Value};

use crate::envelope::Envelope;

/// Normalize every identity frame of an envelope in place
pub fn normalize_envelope(envelope: &mut Envelope) {
    if let Some(idents) = envelope.idents.as_mut() {
        for ident in idents.iter_mut() {
            if let Some(bytes) = decode_bytes(ident) {
                *ident = bytes_to_value(&bytes);
            }
        }
    }
}

/// Normalize a single frame. Total: unrecognized shapes come back unchanged.
pub fn normalize(value: Value) -> Value {
    match decode_bytes(&value) {
        Some(bytes) => bytes_to_value(&bytes),
        None => value,
    }
}

/// Extract the bytes a frame encodes, if it is one of the known binary shapes:
///
/// - a plain array of integers in `0..=255`
/// - a tagged wrapper `{"type": "Buffer", "data": [..]}`
/// - a typed byte array serialized as an object with keys `"0".."n-1"`
pub fn decode_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Array(items) => byte_array(items),
        Value::Object(map) => tagged_wrapper(map).or_else(|| indexed_object(map)),
        _ => None,
    }
}

pub fn bytes_to_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

fn byte_array(items: &[Value]) -> Option<Vec<u8>> {
    items.iter().map(as_byte).collect()
}

fn tagged_wrapper(map: &Map<String, Value>) -> Option<Vec<u8>> {
    if map.get("type").and_then(Value::as_str) != Some("Buffer") {
        return None;
    }
    match map.get("data")? {
        Value::Array(items) => byte_array(items),
        _ => None,
    }
}

fn indexed_object(map: &Map<String, Value>) -> Option<Vec<u8>> {
    // `{}` is indistinguishable from an ordinary empty object
    if map.is_empty() {
        return None;
    }
    let mut bytes = vec![0u8; map.len()];
    let mut seen = vec![false; map.len()];
    for (key, value) in map {
        let index: usize = key.parse().ok()?;
        if index >= bytes.len() || seen[index] || key != &index.to_string() {
            return None;
        }
        bytes[index] = as_byte(value)?;
        seen[index] = true;
    }
    Some(bytes)
}

fn as_byte(value: &Value) -> Option<u8> {
    value.as_u64().and_then(|n| u8::try_from(n).ok())
}
