//! Pass-through relay for targets that are not local kernels.
//!
//! Frames and HTTP bodies are copied unmodified in both directions; close
//! and error states are propagated one to one.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{BridgeError, Result};
use crate::local_adapter::EventSink;
use crate::protocol::{OutboundEvent, close_code};

const OUTGOING_CAPACITY: usize = 256;

/// Frames written by the UI to a remote socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Response of a relayed HTTP call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Write half of one relayed socket. Frames sent before the upstream
/// handshake completes are queued; dropping it closes the socket once the
/// queue is flushed.
#[derive(Debug)]
pub struct RemoteConnection {
    outgoing: mpsc::Sender<RelayFrame>,
    cancel: CancellationToken,
}

impl RemoteConnection {
    pub async fn send(&self, frame: RelayFrame) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| BridgeError::RemoteRelay("remote socket is closed".into()))
    }

    /// Close the upstream socket with the given code
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let frame = RelayFrame::Close {
            code,
            reason: reason.into(),
        };
        if self.outgoing.send(frame).await.is_err() {
            self.cancel.cancel();
        }
    }

    /// Drop the upstream socket without a close handshake
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct RemoteRelay {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl RemoteRelay {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            connect_timeout,
        }
    }

    /// Start relaying one socket. `opened`, inbound frames, `closed` and
    /// `error` are delivered to `sink` under `connection_id`.
    pub fn open(
        &self,
        connection_id: &str,
        url: &Url,
        protocol: Option<&str>,
        sink: EventSink,
    ) -> Result<RemoteConnection> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::RemoteRelay(e.to_string()))?;
        if let Some(protocol) = protocol.filter(|p| !p.is_empty()) {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| BridgeError::RemoteRelay(format!("invalid protocol: {}", e)))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let cancel = CancellationToken::new();

        let task = RelayTask {
            connection_id: connection_id.to_string(),
            url: url.to_string(),
            connect_timeout: self.connect_timeout,
            outgoing_rx,
            sink,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(request));

        Ok(RemoteConnection { outgoing, cancel })
    }

    /// Perform one HTTP call and return the upstream response unmodified
    pub async fn http(
        &self,
        method: &str,
        url: &Url,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
    ) -> Result<HttpReply> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| BridgeError::RemoteRelay(format!("invalid method: {}", e)))?;

        let mut request = self.http.request(method.clone(), url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::RemoteRelay(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::RemoteRelay(e.to_string()))?;

        debug!("Relayed {} {} -> {}", method, url, status);
        Ok(HttpReply {
            status,
            headers,
            body: (!text.is_empty()).then_some(text),
        })
    }
}

struct RelayTask {
    connection_id: String,
    url: String,
    connect_timeout: Duration,
    outgoing_rx: mpsc::Receiver<RelayFrame>,
    sink: EventSink,
    cancel: CancellationToken,
}

impl RelayTask {
    async fn run(mut self, request: tungstenite::handshake::client::Request) {
        let connect = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        );

        let (ws_stream, response) = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = connect => match result {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    self.fail(BridgeError::RemoteRelay(e.to_string())).await;
                    return;
                }
                Err(_) => {
                    self.fail(BridgeError::RemoteRelay(format!(
                        "connect to {} timed out after {:?}",
                        self.url, self.connect_timeout
                    )))
                    .await;
                    return;
                }
            },
        };

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        info!(connection_id = %self.connection_id, url = %self.url, "Remote socket connected");
        self.emit(OutboundEvent::Opened {
            connection_id: self.connection_id.clone(),
            protocol,
        })
        .await;

        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }

                frame = self.outgoing_rx.recv() => {
                    let message = match frame {
                        Some(RelayFrame::Text(text)) => Message::Text(text.into()),
                        Some(RelayFrame::Binary(data)) => Message::Binary(data.into()),
                        Some(RelayFrame::Close { code, reason }) => {
                            let _ = ws_write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if let Err(e) = ws_write.send(message).await {
                        self.fail(BridgeError::RemoteRelay(e.to_string())).await;
                        break;
                    }
                }

                incoming = ws_read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(OutboundEvent::Message {
                            connection_id: self.connection_id.clone(),
                            payload: Value::String(text.as_str().to_string()),
                        })
                        .await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.emit(OutboundEvent::BinaryMessage {
                            connection_id: self.connection_id.clone(),
                            data: data.to_vec(),
                        })
                        .await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((close_code::NO_STATUS, String::new()));
                        self.emit(OutboundEvent::Closed {
                            connection_id: self.connection_id.clone(),
                            code,
                            reason,
                        })
                        .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.fail(BridgeError::RemoteRelay(e.to_string())).await;
                        break;
                    }
                    None => {
                        self.emit(OutboundEvent::Closed {
                            connection_id: self.connection_id.clone(),
                            code: close_code::ABNORMAL,
                            reason: "remote socket ended".to_string(),
                        })
                        .await;
                        break;
                    }
                },
            }
        }

        debug!(connection_id = %self.connection_id, "Remote relay stopped");
    }

    async fn emit(&self, event: OutboundEvent) {
        let _ = self.sink.send(event).await;
    }

    /// Report an upstream failure and close the connection
    async fn fail(&self, err: BridgeError) {
        warn!(connection_id = %self.connection_id, url = %self.url, "{}", err);
        self.emit(OutboundEvent::connection_error(&self.connection_id, &err))
            .await;
        self.emit(OutboundEvent::Closed {
            connection_id: self.connection_id.clone(),
            code: close_code::ABNORMAL,
            reason: err.to_string(),
        })
        .await;
    }
}
