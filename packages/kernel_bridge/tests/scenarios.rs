//! End-to-end behavior of the bridge: surfaces, kernels, remote servers.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    Message,
    handshake::server::{ErrorResponse, Request, Response},
    http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
};

use kernel_bridge::app::{AppState, build_router};
use kernel_bridge::config::BridgeConfig;
use kernel_bridge::envelope::Envelope;
use kernel_bridge::metrics::BridgeMetrics;
use kernel_bridge::protocol::{InboundEvent, OutboundEvent, close_code};
use kernel_bridge::surface::{BridgeContext, BridgeSurface, ConnectionState};
use kernel_channel::{KernelHandle, KernelId, KernelManager, KernelPeer};

const JUPYTER_PROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

async fn context_with_kernel(id: &str) -> (BridgeContext, KernelPeer) {
    let manager = KernelManager::new();
    let (handle, peer) = KernelHandle::in_memory();
    manager.register(id.into(), handle).await.unwrap();
    let ctx = BridgeContext::new(manager, BridgeConfig::default(), Arc::new(BridgeMetrics::new()));
    (ctx, peer)
}

fn surface(ctx: &BridgeContext) -> (BridgeSurface, mpsc::Receiver<OutboundEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (BridgeSurface::new(ctx.clone(), tx), rx)
}

async fn next(rx: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event sink closed")
}

async fn next_frame(peer: &mut KernelPeer) -> Envelope {
    let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv())
        .await
        .expect("timed out waiting for kernel frame")
        .expect("kernel channel closed");
    Envelope::parse(&frame).unwrap()
}

fn open(connection_id: &str, url: &str, protocol: Option<&str>) -> InboundEvent {
    InboundEvent::Open {
        connection_id: connection_id.into(),
        url: url.into(),
        protocol: protocol.map(String::from),
    }
}

fn send(connection_id: &str, payload: Value) -> InboundEvent {
    InboundEvent::Send {
        connection_id: connection_id.into(),
        payload,
    }
}

fn close(connection_id: &str) -> InboundEvent {
    InboundEvent::Close {
        connection_id: connection_id.into(),
        code: None,
        reason: None,
    }
}

fn message_payload(event: OutboundEvent, expected_connection: &str) -> Value {
    match event {
        OutboundEvent::Message {
            connection_id,
            payload,
        } => {
            assert_eq!(connection_id, expected_connection);
            payload
        }
        other => panic!("Expected message, got {:?}", other),
    }
}

// --- Local kernels ---

#[tokio::test]
async fn reply_reaches_only_the_issuing_connection_with_its_session() {
    let (ctx, mut kernel) = context_with_kernel("k1").await;
    let (mut left, mut left_rx) = surface(&ctx);
    let (mut right, mut right_rx) = surface(&ctx);

    left.handle(open("c1", "ws://k1.localkernel/api/kernels/k1/channels", Some(JUPYTER_PROTOCOL)))
        .await;
    right
        .handle(open("c2", "ws://k1.localkernel/api/kernels/k1/channels", Some(JUPYTER_PROTOCOL)))
        .await;
    assert!(matches!(next(&mut left_rx).await, OutboundEvent::Opened { .. }));
    assert!(matches!(next(&mut right_rx).await, OutboundEvent::Opened { .. }));
    assert_eq!(ctx.multiplexer.ref_count(&"k1".into()).await, 2);

    left.handle(send(
        "c1",
        json!({"header": {"msg_id": "m1", "msg_type": "execute_request", "session": "s1"}, "content": {"code": "1+1"}}),
    ))
    .await;
    right
        .handle(send(
            "c2",
            json!({"header": {"msg_id": "m2", "msg_type": "kernel_info_request", "session": "s2"}}),
        ))
        .await;
    assert_eq!(next_frame(&mut kernel).await.msg_id(), "m1");
    assert_eq!(next_frame(&mut kernel).await.msg_id(), "m2");

    kernel.emit(
        json!({
            "header": {"msg_id": "r1", "msg_type": "execute_reply", "session": "k1"},
            "parent_header": {"msg_id": "m1", "session": "s1"},
            "channel": "shell",
            "content": {"status": "ok"}
        })
        .to_string(),
    );
    let reply = message_payload(next(&mut left_rx).await, "c1");
    assert_eq!(reply["header"]["msg_id"], "r1");
    assert_eq!(reply["header"]["session"], "s1");

    // Unsolicited output reaches both; it is the first thing c2 sees
    kernel.emit(
        json!({
            "header": {"msg_id": "st1", "msg_type": "status", "session": "k1"},
            "parent_header": {},
            "channel": "iopub",
            "content": {"execution_state": "idle"}
        })
        .to_string(),
    );
    let status = message_payload(next(&mut right_rx).await, "c2");
    assert_eq!(status["header"]["msg_id"], "st1");
    assert_eq!(status["header"]["session"], "s2");
    let status = message_payload(next(&mut left_rx).await, "c1");
    assert_eq!(status["header"]["session"], "s1");
}

#[tokio::test]
async fn channel_is_torn_down_after_last_release() {
    let (ctx, kernel) = context_with_kernel("k1").await;
    let (mut left, mut left_rx) = surface(&ctx);
    let (mut right, mut right_rx) = surface(&ctx);
    let baseline = kernel.subscriber_count();

    left.handle(open("c1", "ws://k1.localkernel/", None)).await;
    right.handle(open("c2", "ws://K1.LocalKernel/", None)).await;
    next(&mut left_rx).await;
    next(&mut right_rx).await;
    assert_eq!(ctx.multiplexer.channel_count().await, 1);
    assert_eq!(kernel.subscriber_count(), baseline + 1);

    left.handle(close("c1")).await;
    assert_eq!(
        next(&mut left_rx).await,
        OutboundEvent::Closed {
            connection_id: "c1".into(),
            code: close_code::NORMAL,
            reason: String::new(),
        }
    );
    assert!(ctx.multiplexer.has_channel(&"k1".into()).await);
    assert_eq!(ctx.multiplexer.ref_count(&"k1".into()).await, 1);

    right.handle(close("c2")).await;
    next(&mut right_rx).await;
    assert!(!ctx.multiplexer.has_channel(&"k1".into()).await);

    // The pump lets go of its subscription once it observes cancellation
    tokio::time::timeout(Duration::from_secs(5), async {
        while kernel.subscriber_count() > baseline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("kernel subscription was not released");

    // The kernel itself keeps running
    assert!(ctx.kernels().exists(&KernelId::from("k1")).await);
}

#[tokio::test]
async fn reopening_after_teardown_creates_a_fresh_channel() {
    let (ctx, mut kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);

    surface.handle(open("c1", "ws://k1.localkernel/", None)).await;
    next(&mut rx).await;
    surface.handle(close("c1")).await;
    next(&mut rx).await;

    surface.handle(open("c1", "ws://k1.localkernel/", None)).await;
    assert!(matches!(next(&mut rx).await, OutboundEvent::Opened { .. }));
    surface
        .handle(send("c1", json!({"header": {"msg_id": "m9", "session": "s"}})))
        .await;
    assert_eq!(next_frame(&mut kernel).await.msg_id(), "m9");
    assert_eq!(ctx.metrics.snapshot().channels.created, 2);
}

#[tokio::test]
async fn binary_identity_frames_are_normalized_before_delivery() {
    let (ctx, mut kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);
    surface.handle(open("c1", "ws://k1.localkernel/", None)).await;
    next(&mut rx).await;
    surface
        .handle(send("c1", json!({"header": {"msg_id": "m1", "session": "s1"}})))
        .await;
    next_frame(&mut kernel).await;

    kernel.emit(
        json!({
            "header": {"msg_id": "r1", "session": "k1"},
            "parent_header": {"msg_id": "m1"},
            "idents": [{"type": "Buffer", "data": [1, 2]}, {"0": 3, "1": 4}, [5]]
        })
        .to_string(),
    );
    let payload = message_payload(next(&mut rx).await, "c1");
    assert_eq!(payload["idents"], json!([[1, 2], [3, 4], [5]]));
}

fn idle_status(msg_id: &str) -> String {
    json!({
        "header": {"msg_id": msg_id, "msg_type": "status", "session": "k1"},
        "parent_header": {},
        "channel": "iopub",
        "content": {"execution_state": "idle"}
    })
    .to_string()
}

#[tokio::test]
async fn client_envelopes_reach_the_kernel_in_send_order() {
    let (ctx, mut kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);
    surface.handle(open("c1", "ws://k1.localkernel/", None)).await;
    next(&mut rx).await;

    for n in 0..50 {
        surface
            .handle(send(
                "c1",
                json!({"header": {"msg_id": format!("m{n}"), "msg_type": "execute_request", "session": "s1"}}),
            ))
            .await;
    }
    for n in 0..50 {
        assert_eq!(next_frame(&mut kernel).await.msg_id(), format!("m{n}"));
    }
}

#[tokio::test]
async fn kernel_output_reaches_a_connection_in_emit_order() {
    let (ctx, kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);
    surface.handle(open("c1", "ws://k1.localkernel/", None)).await;
    next(&mut rx).await;

    for n in 0..50 {
        kernel.emit(idle_status(&format!("st{n}")));
    }
    for n in 0..50 {
        let payload = message_payload(next(&mut rx).await, "c1");
        assert_eq!(payload["header"]["msg_id"], format!("st{n}"));
    }
}

#[tokio::test]
async fn surface_that_stops_reading_does_not_stall_its_siblings() {
    let (ctx, kernel) = context_with_kernel("k1").await;
    // Room for the open acknowledgement only; never drained afterwards
    let (stalled_tx, _stalled_rx) = mpsc::channel(1);
    let mut stalled = BridgeSurface::new(ctx.clone(), stalled_tx);
    let (mut reader, mut reader_rx) = surface(&ctx);

    stalled.handle(open("c1", "ws://k1.localkernel/", None)).await;
    reader.handle(open("c2", "ws://k1.localkernel/", None)).await;
    assert!(matches!(next(&mut reader_rx).await, OutboundEvent::Opened { .. }));
    assert_eq!(ctx.multiplexer.ref_count(&"k1".into()).await, 2);

    for n in 0..40 {
        kernel.emit(idle_status(&format!("st{n}")));
    }
    for n in 0..40 {
        let payload = message_payload(next(&mut reader_rx).await, "c2");
        assert_eq!(payload["header"]["msg_id"], format!("st{n}"));
    }
    assert_eq!(stalled.state("c1"), Some(ConnectionState::Open));
}

// --- Remote targets ---

/// Echoes text and binary frames; accepts whatever subprotocol is offered
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let negotiate = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                    if let Some(protocol) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                        resp.headers_mut()
                            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, negotiate).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    } else if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn remote_sockets_are_relayed_unmodified() {
    let addr = echo_server().await;
    let (ctx, _kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);

    let url = format!("ws://{}/api/kernels/abc/channels", addr);
    surface.handle(open("r1", &url, Some(JUPYTER_PROTOCOL))).await;
    assert_eq!(surface.state("r1"), Some(ConnectionState::Opening));

    let opened = next(&mut rx).await;
    assert_eq!(
        opened,
        OutboundEvent::Opened {
            connection_id: "r1".into(),
            protocol: Some(JUPYTER_PROTOCOL.into()),
        }
    );
    surface.observe(&opened).await;
    assert_eq!(surface.state("r1"), Some(ConnectionState::Open));

    // Session ids are left alone on remote connections
    let text = r#"{"header":{"msg_id":"m1","session":"client-session"},"parent_header":{},"content":{}}"#;
    surface.handle(send("r1", Value::String(text.into()))).await;
    assert_eq!(message_payload(next(&mut rx).await, "r1"), Value::String(text.into()));

    let object = json!({"header": {"msg_id": "m2", "session": "other"}});
    surface.handle(send("r1", object.clone())).await;
    assert_eq!(
        message_payload(next(&mut rx).await, "r1"),
        Value::String(object.to_string())
    );

    surface
        .handle(InboundEvent::SendBinary {
            connection_id: "r1".into(),
            data: vec![0, 159, 255],
        })
        .await;
    assert_eq!(
        next(&mut rx).await,
        OutboundEvent::BinaryMessage {
            connection_id: "r1".into(),
            data: vec![0, 159, 255],
        }
    );

    surface.handle(close("r1")).await;
    assert!(matches!(
        next(&mut rx).await,
        OutboundEvent::Closed { code: close_code::NORMAL, .. }
    ));
    assert_eq!(surface.state("r1"), None);
    assert_eq!(ctx.multiplexer.connection_count().await, 0);
}

#[tokio::test]
async fn unreachable_remote_reports_error_then_close() {
    let (ctx, _kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);

    surface.handle(open("r1", "ws://127.0.0.1:9/socket", None)).await;
    assert!(matches!(
        next(&mut rx).await,
        OutboundEvent::Error { connection_id: Some(ref id), .. } if id == "r1"
    ));
    let closed = next(&mut rx).await;
    assert!(matches!(
        closed,
        OutboundEvent::Closed { code: close_code::ABNORMAL, .. }
    ));
    surface.observe(&closed).await;
    assert_eq!(surface.connection_count(), 0);
}

#[tokio::test]
async fn remote_http_is_forwarded_not_emulated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = axum::Router::new().route(
        "/api/sessions",
        axum::routing::get(|| async {
            (
                [("x-upstream", "yes")],
                axum::Json(json!([{"id": "remote-session"}])),
            )
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, upstream).await;
    });

    let (ctx, _kernel) = context_with_kernel("k1").await;
    let (mut surface, mut rx) = surface(&ctx);
    surface
        .handle(InboundEvent::HttpRequest {
            request_id: "q1".into(),
            method: "get".into(),
            url: format!("http://{}/api/sessions", addr),
            headers: Default::default(),
            body: None,
        })
        .await;

    match next(&mut rx).await {
        OutboundEvent::HttpResponse {
            request_id,
            status,
            headers,
            body,
        } => {
            assert_eq!(request_id, "q1");
            assert_eq!(status, 200);
            assert_eq!(headers.get("x-upstream").map(String::as_str), Some("yes"));
            let body: Value = serde_json::from_str(&body.unwrap()).unwrap();
            assert_eq!(body, json!([{"id": "remote-session"}]));
        }
        other => panic!("Expected http response, got {:?}", other),
    }
    assert_eq!(ctx.metrics.snapshot().http.relayed, 1);
    assert_eq!(ctx.metrics.snapshot().http.emulated, 0);
}

// --- Through the server ---

async fn serve(ctx: BridgeContext) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState { bridge: ctx });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn bridge_socket_drives_a_local_kernel() {
    let (ctx, mut kernel) = context_with_kernel("k1").await;
    let addr = serve(ctx.clone()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/bridge", addr))
        .await
        .unwrap();

    async fn recv_event(
        ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ) -> OutboundEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for bridge event")
                .expect("bridge socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    let open = json!({"type": "open", "connection_id": "c1", "url": "ws://k1.localkernel/api/kernels/k1/channels"});
    ws.send(Message::Text(open.to_string().into())).await.unwrap();
    assert_eq!(
        recv_event(&mut ws).await,
        OutboundEvent::Opened {
            connection_id: "c1".into(),
            protocol: None,
        }
    );

    let request = json!({
        "type": "send",
        "connection_id": "c1",
        "payload": {"header": {"msg_id": "m1", "session": "s1"}, "content": {}}
    });
    ws.send(Message::Text(request.to_string().into())).await.unwrap();
    assert_eq!(next_frame(&mut kernel).await.session(), "s1");

    kernel.emit(
        json!({"header": {"msg_id": "r1", "session": "k1"}, "parent_header": {"msg_id": "m1"}})
            .to_string(),
    );
    match recv_event(&mut ws).await {
        OutboundEvent::Message {
            connection_id,
            payload,
        } => {
            assert_eq!(connection_id, "c1");
            assert_eq!(payload["header"]["session"], "s1");
        }
        other => panic!("Expected message, got {:?}", other),
    }

    let health: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .text()
        .await
        .map(|t| serde_json::from_str(&t).unwrap())
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["kernels"], 1);
    assert_eq!(health["channels"], 1);

    // Dropping the surface releases its connections
    ws.close(None).await.unwrap();
    drop(ws);
    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.multiplexer.has_channel(&"k1".into()).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel was not torn down after the surface went away");
}

#[tokio::test]
async fn local_kernel_endpoints_list_and_shut_down() {
    let (ctx, _kernel) = context_with_kernel("k1").await;
    let addr = serve(ctx.clone()).await;
    let client = reqwest::Client::new();

    let listed: Value = serde_json::from_str(
        &client
            .get(format!("http://{}/api/local-kernels", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let response = client
        .delete(format!("http://{}/api/local-kernels/k1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert!(!ctx.kernels().exists(&KernelId::from("k1")).await);

    let response = client
        .delete(format!("http://{}/api/local-kernels/k1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    // No command configured and none supplied
    let response = client
        .post(format!("http://{}/api/local-kernels", addr))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}
