//! Jupyter wire envelope, parsed once at the bridge boundary.
//!
//! Only the fields the bridge routes on are typed; everything else is kept
//! in flattened maps so an envelope re-serializes with its original content.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    /// username, date, version, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    /// `{}` for unsolicited messages; kept as-is so it round-trips
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_header: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    /// Binary identity frames, see `buffer_codec`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idents: Option<Vec<Value>>,
    /// metadata, buffers, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Parse an envelope from serialized JSON text
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::MalformedEnvelope(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Parse an envelope from a UI payload: either the envelope object itself
    /// or a string holding its JSON text
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::String(text) => Self::parse(text),
            other => Self::from_value(other.clone()),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(BridgeError::MalformedEnvelope(
                "envelope is not a JSON object".into(),
            ));
        }
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))?;
        if envelope.header.msg_id.trim().is_empty() {
            return Err(BridgeError::MalformedEnvelope(
                "header.msg_id is empty".into(),
            ));
        }
        Ok(envelope)
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn session(&self) -> &str {
        &self.header.session
    }

    pub fn set_session(&mut self, session: impl Into<String>) {
        self.header.session = session.into();
    }

    /// The `parent_header.msg_id` this message replies to, if any
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .and_then(|p| p.get("msg_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))
    }
}
