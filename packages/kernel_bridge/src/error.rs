//! Bridge error taxonomy and the codes surfaced to the hosting UI.

use kernel_channel::KernelError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Envelope without a usable `header.msg_id` (or not an envelope at all)
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No live kernel channel for this id
    #[error("kernel unavailable: {kernel_id}")]
    KernelUnavailable { kernel_id: String },

    /// The kernel channel rejected a frame
    #[error("send failed: {0}")]
    SendFailure(String),

    /// The target URL could not be classified
    #[error("unroutable target {url}: {reason}")]
    UnroutableTarget { url: String, reason: String },

    #[error("connection already open: {0}")]
    DuplicateConnection(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// Upstream socket or HTTP failure on the remote path
    #[error("remote relay failed: {0}")]
    RemoteRelay(String),
}

impl BridgeError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::KernelUnavailable { .. } => "kernel_unavailable",
            Self::SendFailure(_) => "send_failure",
            Self::UnroutableTarget { .. } => "unroutable_target",
            Self::DuplicateConnection(_) => "duplicate_connection",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::RemoteRelay(_) => "remote_relay",
        }
    }

    /// Text carried by the `error` event
    pub fn user_message(&self) -> String {
        format!("{}: {}", self.error_code(), self)
    }

    pub(crate) fn unroutable(url: &str, reason: impl Into<String>) -> Self {
        Self::UnroutableTarget {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<KernelError> for BridgeError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::NotFound(kernel_id) => Self::KernelUnavailable { kernel_id },
            other => Self::SendFailure(other.to_string()),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
