use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::app::AppState;
use crate::protocol::OutboundEvent;
use crate::surface::{BridgeContext, BridgeSurface};

/// One bridge socket per hosting UI surface
pub async fn bridge_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = state.bridge.clone();
    ws.on_upgrade(move |socket| handle_bridge_socket(socket, ctx))
}

pub async fn handle_bridge_socket(socket: WebSocket, ctx: BridgeContext) {
    ctx.metrics.surface_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<OutboundEvent>(ctx.config.event_channel_capacity);
    // Lifecycle events fed back to the surface; unbounded so the sender
    // never waits on the input loop
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel::<OutboundEvent>();

    let mut surface = BridgeSurface::new(ctx.clone(), event_tx);
    info!(surface = %surface.id(), "Bridge surface connected");

    let sender_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if matches!(
                event,
                OutboundEvent::Opened { .. } | OutboundEvent::Closed { .. }
            ) {
                let _ = lifecycle_tx.send(event.clone());
            }
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize bridge event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => surface.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(surface = %surface.id(), "Bridge socket error: {}", e);
                    break;
                }
            },
            Some(event) = lifecycle_rx.recv() => surface.observe(&event).await,
        }
    }

    surface.dispose().await;
    info!(surface = %surface.id(), "Bridge surface disconnected");
    sender_task.abort();
    ctx.metrics.surface_closed();
}
