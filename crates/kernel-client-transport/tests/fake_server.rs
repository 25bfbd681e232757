//! Tests for the REST and WebSocket transports against an in-process server.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures::{SinkExt, StreamExt};
use kernel_client_core::{
    ChannelConnector, Envelope, KernelApi, ServerConfig, Timeouts, TransportError,
};
use kernel_client_transport::{RestClient, WsConnector, probe};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const TOKEN: &str = "secret";

#[derive(Clone, Default)]
struct FakeServer {
    kernels: Arc<Mutex<Vec<String>>>,
    interrupts: Arc<Mutex<Vec<String>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("token {TOKEN}"))
}

async fn list_kernels(State(s): State<FakeServer>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let kernels: Vec<Value> = s
        .kernels
        .lock()
        .unwrap()
        .iter()
        .map(|id| json!({"id": id, "name": "python3"}))
        .collect();
    Json(kernels).into_response()
}

async fn create_kernel(State(s): State<FakeServer>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    let mut kernels = s.kernels.lock().unwrap();
    let id = format!("kernel-{}", kernels.len() + 1);
    kernels.push(id.clone());
    (
        StatusCode::CREATED,
        Json(json!({"id": id, "name": "python3", "execution_state": "starting"})),
    )
        .into_response()
}

async fn delete_kernel(State(s): State<FakeServer>, Path(id): Path<String>) -> StatusCode {
    let mut kernels = s.kernels.lock().unwrap();
    let before = kernels.len();
    kernels.retain(|k| *k != id);
    if kernels.len() == before {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn interrupt_kernel(State(s): State<FakeServer>, Path(id): Path<String>) -> StatusCode {
    s.interrupts.lock().unwrap().push(id);
    StatusCode::NO_CONTENT
}

async fn channels(ws: WebSocketUpgrade, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(handle_channel)
}

fn reply(parent: &str, msg_type: &str, content: Value) -> Message {
    let msg = json!({
        "header": {"msg_id": format!("{parent}-{msg_type}"), "msg_type": msg_type},
        "parent_header": {"msg_id": parent},
        "metadata": {},
        "content": content,
        "channel": "iopub",
    });
    Message::Text(msg.to_string().into())
}

async fn handle_channel(socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    while let Some(Ok(msg)) = rx.next().await {
        let Message::Text(text) = msg else { continue };
        let request: Value = serde_json::from_str(text.as_str()).unwrap();
        let parent = request["header"]["msg_id"].as_str().unwrap().to_string();

        for frame in [
            reply(&parent, "status", json!({"execution_state": "busy"})),
            reply(&parent, "stream", json!({"name": "stdout", "text": "x\n"})),
            reply(&parent, "status", json!({"execution_state": "idle"})),
        ] {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_server() -> (SocketAddr, FakeServer) {
    let state = FakeServer::default();
    let app = Router::new()
        .route("/api/kernels", get(list_kernels).post(create_kernel))
        .route("/api/kernels/{id}", delete(delete_kernel))
        .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
        .route("/api/kernels/{id}/channels", get(channels))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn config(addr: SocketAddr, token: &str) -> ServerConfig {
    ServerConfig::new(format!("http://{addr}/"), Some(token))
}

#[tokio::test]
async fn rest_client_kernel_lifecycle() {
    let (addr, server) = spawn_server().await;
    let client = RestClient::new(config(addr, TOKEN), Timeouts::default()).unwrap();

    let kernel = client.create_kernel().await.unwrap();
    assert_eq!(kernel.id, "kernel-1");
    assert_eq!(client.list_kernels().await.unwrap().len(), 1);

    client.interrupt_kernel(&kernel.id).await.unwrap();
    assert_eq!(*server.interrupts.lock().unwrap(), vec!["kernel-1"]);

    client.delete_kernel(&kernel.id).await.unwrap();
    // Already gone: still succeeds.
    client.delete_kernel(&kernel.id).await.unwrap();
    assert!(client.list_kernels().await.unwrap().is_empty());
}

#[tokio::test]
async fn rest_client_reports_rejected_token() {
    let (addr, _server) = spawn_server().await;
    let client = RestClient::new(config(addr, "wrong"), Timeouts::default()).unwrap();

    let err = client.create_kernel().await.unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 403, .. }));
}

#[tokio::test]
async fn websocket_channel_round_trip() {
    let (addr, _server) = spawn_server().await;
    let config = config(addr, TOKEN);
    let client = RestClient::new(config.clone(), Timeouts::default()).unwrap();
    let kernel = client.create_kernel().await.unwrap();

    let connector = WsConnector::new(config, Duration::from_secs(5));
    let mut channel = connector.open(&kernel.id, "session-1").await.unwrap();

    let request = Envelope::execute_request("session-1", "print('x')");
    channel.outbound.send(request.to_frame().unwrap()).unwrap();

    let mut types = Vec::new();
    for _ in 0..3 {
        let frame = channel.inbound.next().await.unwrap().unwrap();
        let msg = Envelope::parse(&frame).unwrap();
        assert_eq!(msg.parent_msg_id(), Some(request.msg_id()));
        types.push(msg.header.msg_type);
    }
    assert_eq!(types, vec!["status", "stream", "status"]);

    drop(channel.outbound);
}

#[tokio::test]
async fn websocket_channel_rejected_without_token() {
    let (addr, _server) = spawn_server().await;
    let connector = WsConnector::new(
        ServerConfig::new(format!("http://{addr}"), None::<String>),
        Duration::from_secs(5),
    );

    let err = connector.open("kernel-1", "session-1").await.err().unwrap();
    assert!(matches!(err, TransportError::WebSocket(_)));
}

#[tokio::test]
async fn probe_reports_server_state() {
    let (addr, _server) = spawn_server().await;
    let client = RestClient::new(config(addr, TOKEN), Timeouts::default()).unwrap();
    client.create_kernel().await.unwrap();

    let up = probe(&client, Duration::from_secs(2)).await;
    assert!(up.available);
    assert_eq!(up.active_kernels, 1);

    // Nothing listens on the loopback discard port.
    let unreachable = ServerConfig::new("http://127.0.0.1:9", None::<String>);
    let dead = RestClient::new(unreachable, Timeouts::default()).unwrap();
    assert!(!probe(&dead, Duration::from_secs(2)).await.available);
}
