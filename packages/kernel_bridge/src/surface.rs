//! One hosting UI surface and the connections it has opened.

use kernel_channel::{KernelId, KernelManager};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::envelope::Envelope;
use crate::error::BridgeError;
use crate::local_adapter::EventSink;
use crate::metrics::BridgeMetrics;
use crate::multiplexer::ConnectionMultiplexer;
use crate::protocol::{InboundEvent, OutboundEvent, close_code};
use crate::remote_relay::{RelayFrame, RemoteConnection, RemoteRelay};
use crate::rest_emulator;
use crate::router::{Route, TransportRouter};

/// Everything surfaces share: one per bridge instance
#[derive(Clone)]
pub struct BridgeContext {
    pub router: TransportRouter,
    pub multiplexer: ConnectionMultiplexer,
    pub relay: RemoteRelay,
    pub metrics: Arc<BridgeMetrics>,
    pub config: BridgeConfig,
}

impl BridgeContext {
    pub fn new(kernels: KernelManager, config: BridgeConfig, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            router: TransportRouter::new(config.local_marker.clone()),
            multiplexer: ConnectionMultiplexer::new(kernels, metrics.clone()),
            relay: RemoteRelay::new(config.remote_connect_timeout),
            metrics,
            config,
        }
    }

    pub fn kernels(&self) -> &KernelManager {
        self.multiplexer.kernels()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Closed,
}

enum ConnectionRoute {
    Local { kernel_id: KernelId },
    Remote { relay: RemoteConnection },
}

struct Connection {
    route: ConnectionRoute,
    state: ConnectionState,
}

/// Dispatches one surface's inbound events.
///
/// Outbound events (including those produced by kernels and remote sockets)
/// go to `events`. Whoever drains `events` must hand `opened`/`closed` back
/// through `observe` so connection state stays current.
pub struct BridgeSurface {
    id: String,
    ctx: BridgeContext,
    events: EventSink,
    connections: HashMap<String, Connection>,
    /// `closed` events this surface emitted itself, not yet seen by `observe`
    own_closes: HashMap<String, VecDeque<OutboundEvent>>,
}

impl BridgeSurface {
    pub fn new(ctx: BridgeContext, events: EventSink) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ctx,
            events,
            connections: HashMap::new(),
            own_closes: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state of a connection; `Closed` once it is gone
    pub fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.connections.get(connection_id).map(|c| c.state)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Parse and dispatch one text frame from the UI
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<InboundEvent>(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => warn!(surface = %self.id, "Dropping unparsable bridge event: {}", e),
        }
    }

    pub async fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Open {
                connection_id,
                url,
                protocol,
            } => self.open(connection_id, &url, protocol.as_deref()).await,
            InboundEvent::Send {
                connection_id,
                payload,
            } => self.send(&connection_id, payload).await,
            InboundEvent::SendBinary {
                connection_id,
                data,
            } => self.send_binary(&connection_id, data).await,
            InboundEvent::Close {
                connection_id,
                code,
                reason,
            } => self.close(&connection_id, code, reason).await,
            InboundEvent::HttpRequest {
                request_id,
                method,
                url,
                headers,
                body,
            } => self.http_request(request_id, &method, &url, headers, body).await,
            InboundEvent::Dispose => self.dispose().await,
        }
    }

    async fn open(&mut self, connection_id: String, url: &str, protocol: Option<&str>) {
        if self.connections.contains_key(&connection_id) {
            let err = BridgeError::DuplicateConnection(connection_id.clone());
            self.emit_error(&connection_id, &err).await;
            return;
        }

        let route = match self.ctx.router.classify(url) {
            Ok(route) => route,
            Err(e) => {
                warn!(surface = %self.id, connection_id = %connection_id, "{}", e);
                self.emit_error(&connection_id, &e).await;
                return;
            }
        };

        match route {
            Route::Local { kernel_id, .. } => {
                let acquired = self
                    .ctx
                    .multiplexer
                    .acquire(&kernel_id, &connection_id, self.events.clone())
                    .await;
                match acquired {
                    Ok(acquired) => {
                        info!(
                            surface = %self.id,
                            connection_id = %connection_id,
                            kernel_id = %kernel_id,
                            reused = acquired.reused,
                            "Local kernel connection opened"
                        );
                        self.ctx.metrics.local_connection_opened();
                        self.connections.insert(
                            connection_id.clone(),
                            Connection {
                                route: ConnectionRoute::Local { kernel_id },
                                state: ConnectionState::Open,
                            },
                        );
                        // The channel is already live; acknowledge this connection only
                        self.emit(OutboundEvent::Opened {
                            connection_id,
                            protocol: None,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(surface = %self.id, connection_id = %connection_id, "{}", e);
                        self.emit_error(&connection_id, &e).await;
                    }
                }
            }
            Route::Remote { url } => {
                match self
                    .ctx
                    .relay
                    .open(&connection_id, &url, protocol, self.events.clone())
                {
                    Ok(relay) => {
                        info!(
                            surface = %self.id,
                            connection_id = %connection_id,
                            url = %url,
                            "Remote connection opening"
                        );
                        self.ctx.metrics.remote_connection_opened();
                        self.connections.insert(
                            connection_id,
                            Connection {
                                route: ConnectionRoute::Remote { relay },
                                state: ConnectionState::Opening,
                            },
                        );
                    }
                    Err(e) => self.emit_error(&connection_id, &e).await,
                }
            }
        }
    }

    async fn send(&mut self, connection_id: &str, payload: Value) {
        let Some(connection) = self.connections.get(connection_id) else {
            let err = BridgeError::UnknownConnection(connection_id.to_string());
            self.emit_error(connection_id, &err).await;
            return;
        };

        let result = match &connection.route {
            ConnectionRoute::Local { .. } => {
                let envelope = match Envelope::from_payload(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // Malformed input is dropped, never surfaced
                        self.ctx.metrics.malformed_envelope();
                        warn!(surface = %self.id, connection_id, "Dropping client envelope: {}", e);
                        return;
                    }
                };
                self.ctx.multiplexer.send(connection_id, &envelope).await
            }
            ConnectionRoute::Remote { relay } => {
                let text = match payload {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                relay.send(RelayFrame::Text(text)).await
            }
        };

        if let Err(e) = result {
            self.emit_error(connection_id, &e).await;
        }
    }

    async fn send_binary(&mut self, connection_id: &str, data: Vec<u8>) {
        let result = match self.connections.get(connection_id).map(|c| &c.route) {
            Some(ConnectionRoute::Remote { relay }) => relay.send(RelayFrame::Binary(data)).await,
            Some(ConnectionRoute::Local { .. }) => {
                self.ctx.metrics.malformed_envelope();
                warn!(
                    surface = %self.id,
                    connection_id,
                    "Dropping binary frame on a local kernel connection"
                );
                Ok(())
            }
            None => Err(BridgeError::UnknownConnection(connection_id.to_string())),
        };
        if let Err(e) = result {
            self.emit_error(connection_id, &e).await;
        }
    }

    async fn close(&mut self, connection_id: &str, code: Option<u16>, reason: Option<String>) {
        let Some(connection) = self.connections.remove(connection_id) else {
            debug!(surface = %self.id, connection_id, "Close for unknown connection ignored");
            return;
        };
        let code = code.unwrap_or(close_code::NORMAL);
        let reason = reason.unwrap_or_default();

        match connection.route {
            ConnectionRoute::Local { kernel_id } => {
                self.ctx.multiplexer.release(connection_id).await;
                debug!(surface = %self.id, connection_id, kernel_id = %kernel_id, "Local connection closed");
            }
            ConnectionRoute::Remote { relay } => relay.close(code, reason.clone()).await,
        }

        let closed = OutboundEvent::Closed {
            connection_id: connection_id.to_string(),
            code,
            reason,
        };
        self.own_closes
            .entry(connection_id.to_string())
            .or_default()
            .push_back(closed.clone());
        self.emit(closed).await;
    }

    async fn http_request(
        &mut self,
        request_id: String,
        method: &str,
        url: &str,
        headers: std::collections::BTreeMap<String, String>,
        body: Option<String>,
    ) {
        let route = match self.ctx.router.classify(url) {
            Ok(route) => route,
            Err(e) => {
                self.emit(OutboundEvent::request_error(request_id, &e)).await;
                return;
            }
        };

        match route {
            Route::Local { kernel_id, url } => {
                let path = match url.query() {
                    Some(query) => format!("{}?{}", url.path(), query),
                    None => url.path().to_string(),
                };
                let response =
                    rest_emulator::emulate(method, &path, kernel_id.as_str(), body.as_deref());
                self.ctx.metrics.rest_emulation();
                debug!(
                    surface = %self.id,
                    kernel_id = %kernel_id,
                    "Emulated {} {} -> {}",
                    method,
                    path,
                    response.status
                );
                self.emit(OutboundEvent::HttpResponse {
                    request_id,
                    status: response.status,
                    headers: response.headers(),
                    body: response.body_text(),
                })
                .await;
            }
            Route::Remote { url } => {
                // Upstream latency must not stall this surface's other traffic
                self.ctx.metrics.remote_http_request();
                let relay = self.ctx.relay.clone();
                let events = self.events.clone();
                let method = method.to_string();
                tokio::spawn(async move {
                    let event = match relay.http(&method, &url, &headers, body).await {
                        Ok(reply) => OutboundEvent::HttpResponse {
                            request_id,
                            status: reply.status,
                            headers: reply.headers,
                            body: reply.body,
                        },
                        Err(e) => {
                            warn!("Remote HTTP {} {} failed: {}", method, url, e);
                            OutboundEvent::request_error(request_id, &e)
                        }
                    };
                    let _ = events.send(event).await;
                });
            }
        }
    }

    /// Track lifecycle events produced outside the surface
    ///
    /// Lifecycle events for a connection this surface closed itself belong to
    /// that closed connection until its own `closed` comes back, even when the
    /// id has been reopened in the meantime.
    pub async fn observe(&mut self, event: &OutboundEvent) {
        if self.is_stale(event) {
            debug!(
                surface = %self.id,
                connection_id = ?event.connection_id(),
                "Ignoring lifecycle event of a closed connection"
            );
            return;
        }
        match event {
            OutboundEvent::Opened { connection_id, .. } => {
                if let Some(connection) = self.connections.get_mut(connection_id) {
                    connection.state = ConnectionState::Open;
                }
            }
            OutboundEvent::Closed { connection_id, .. } => {
                if let Some(connection) = self.connections.remove(connection_id) {
                    if let ConnectionRoute::Local { .. } = connection.route {
                        self.ctx.multiplexer.release(connection_id).await;
                    }
                    debug!(surface = %self.id, connection_id = %connection_id, "Connection closed by peer");
                }
            }
            _ => {}
        }
    }

    /// Consume the echo of a close this surface emitted, or anything the closed
    /// connection produced ahead of it
    fn is_stale(&mut self, event: &OutboundEvent) -> bool {
        if !matches!(event, OutboundEvent::Opened { .. } | OutboundEvent::Closed { .. }) {
            return false;
        }
        let Some(connection_id) = event.connection_id() else {
            return false;
        };
        let Some(pending) = self.own_closes.get_mut(connection_id) else {
            return false;
        };
        if pending.front() == Some(event) {
            pending.pop_front();
            if pending.is_empty() {
                self.own_closes.remove(connection_id);
            }
        }
        true
    }

    /// Release every local connection and drop every remote one.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        info!(
            surface = %self.id,
            connections = self.connections.len(),
            "Disposing surface"
        );
        for (connection_id, connection) in self.connections.drain() {
            match connection.route {
                ConnectionRoute::Local { .. } => {
                    self.ctx.multiplexer.release(&connection_id).await;
                }
                ConnectionRoute::Remote { relay } => {
                    relay.close(close_code::GOING_AWAY, "surface disposed").await;
                }
            }
        }
    }

    async fn emit(&self, event: OutboundEvent) {
        if self.events.send(event).await.is_err() {
            debug!(surface = %self.id, "Surface event sink closed");
        }
    }

    async fn emit_error(&self, connection_id: &str, err: &BridgeError) {
        self.emit(OutboundEvent::connection_error(connection_id, err))
            .await;
    }
}
