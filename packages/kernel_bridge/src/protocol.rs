//! Events exchanged with a hosting UI surface over its bridge socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::BridgeError;

/// Events sent by the UI surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Open {
        connection_id: String,
        url: String,
        #[serde(default)]
        protocol: Option<String>,
    },
    /// `payload` is an envelope object, or a string holding one
    Send {
        connection_id: String,
        payload: Value,
    },
    /// Raw bytes; only meaningful for remote connections
    SendBinary {
        connection_id: String,
        data: Vec<u8>,
    },
    Close {
        connection_id: String,
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    HttpRequest {
        request_id: String,
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
    /// The surface is going away; release everything it opened
    Dispose,
}

/// Events sent to the UI surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Opened {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    Message {
        connection_id: String,
        payload: Value,
    },
    BinaryMessage {
        connection_id: String,
        data: Vec<u8>,
    },
    Closed {
        connection_id: String,
        code: u16,
        reason: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    HttpResponse {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

impl OutboundEvent {
    pub fn connection_error(connection_id: impl Into<String>, err: &BridgeError) -> Self {
        Self::Error {
            connection_id: Some(connection_id.into()),
            request_id: None,
            message: err.user_message(),
        }
    }

    pub fn request_error(request_id: impl Into<String>, err: &BridgeError) -> Self {
        Self::Error {
            connection_id: None,
            request_id: Some(request_id.into()),
            message: err.user_message(),
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Self::Opened { connection_id, .. }
            | Self::Message { connection_id, .. }
            | Self::BinaryMessage { connection_id, .. }
            | Self::Closed { connection_id, .. } => Some(connection_id),
            Self::Error { connection_id, .. } => connection_id.as_deref(),
            Self::HttpResponse { .. } => None,
        }
    }
}

/// Close codes used by the bridge
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    /// Peer closed without a status code
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INTERNAL_ERROR: u16 = 1011;
    /// The connection could not keep up with its kernel
    pub const TRY_AGAIN_LATER: u16 = 1013;
}
