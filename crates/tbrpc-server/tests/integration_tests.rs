//! Integration tests for the tbrpc WebSocket server.
//!
//! Each test starts a server in-process on an auto-assigned port and talks to
//! it through real WebSocket connections.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tbrpc::{ConnectionContext, RouteTable, RpcOptions, ServerRouter, ServerRoutes, TbrpcError};
use tbrpc_server::{connect, handlers::demo_routes, start_server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Start a server for `router` and return its WebSocket URL and port.
async fn spawn_server(router: ServerRouter) -> (String, u16) {
    let addr = start_server(router, "127.0.0.1", 0)
        .await
        .expect("Failed to start server");
    (format!("ws://{}/ws", addr), addr.port())
}

async fn demo_server() -> (String, u16) {
    spawn_server(ServerRouter::builder().routes(demo_routes()).build()).await
}

/// Fetch `/health` with a bare HTTP/1.1 request.
async fn health(port: u16) -> Value {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("Failed to connect for health check");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let body = raw.split("\r\n\r\n").nth(1).expect("response has a body");
    serde_json::from_str(body).expect("health body is JSON")
}

/// Poll `/health` until it reports `expected` connections.
async fn wait_for_connections(port: u16, expected: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if health(port).await["connections"].as_u64() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Client routes that record every `notify(from, message)` they receive.
fn notify_routes(inbox: mpsc::UnboundedSender<(String, String)>) -> RouteTable {
    RouteTable::new().typed_route("notify", move |(from, message): (String, String)| {
        let inbox = inbox.clone();
        async move {
            let _ = inbox.send((from, message));
            Ok(true)
        }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_url, port) = demo_server().await;
    let body = health(port).await;
    assert_eq!(body, json!({"status": "ok", "connections": 0}));
}

#[tokio::test]
async fn test_add_round_trip() {
    let (url, _port) = demo_server().await;
    let client = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();

    let sum: i64 = client.call("add", (2, 3)).await.unwrap();
    assert_eq!(sum, 5);

    let pong: String = client.call("ping", ()).await.unwrap();
    assert_eq!(pong, "pong");

    client.close().await;
}

#[tokio::test]
async fn test_unknown_route_fails_fast() {
    let (url, _port) = demo_server().await;
    let client = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), client.call::<Value, _>("nope", ()))
        .await
        .expect("failure response arrives before the call timeout")
        .unwrap_err();
    let remote = err.as_remote().expect("remote failure");
    assert_eq!(remote.code, -32601);
    assert_eq!(remote.message, "No route found for function: nope");
}

#[tokio::test]
async fn test_handler_error_becomes_failure_response() {
    let (url, _port) = demo_server().await;
    let client = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();

    let err = client.call::<Value, _>("fail", ("disk full",)).await.unwrap_err();
    assert!(matches!(err, TbrpcError::Remote(ref remote) if remote.message == "disk full"));

    // The connection keeps working afterwards.
    let sum: i64 = client.call("add", (1, 1)).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn test_concurrent_calls_complete_out_of_order() {
    let routes = ServerRoutes::new().typed_route(
        "delay",
        |_ctx, (millis, value): (u64, String)| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(value)
        },
    );
    let (url, _port) = spawn_server(ServerRouter::builder().routes(routes).build()).await;
    let client = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let track = |millis: u64, value: &'static str| {
        let finished = finished.clone();
        let call = client.invoke("delay", vec![json!(millis), json!(value)]);
        async move {
            let result = call.await.unwrap();
            finished.lock().unwrap().push(value);
            result
        }
    };

    let (slow, fast, medium) = tokio::join!(
        track(300, "slow"),
        track(10, "fast"),
        track(100, "medium")
    );
    assert_eq!(slow, json!("slow"));
    assert_eq!(fast, json!("fast"));
    assert_eq!(medium, json!("medium"));
    assert_eq!(*finished.lock().unwrap(), vec!["fast", "medium", "slow"]);
}

#[tokio::test]
async fn test_each_handler_sees_its_own_connection() {
    let (url, port) = demo_server().await;
    let first = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();
    let second = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();
    assert!(wait_for_connections(port, 2).await);

    let a: String = first.call("whoami", ()).await.unwrap();
    let b: String = second.call("whoami", ()).await.unwrap();
    assert_ne!(a, b);

    let peers: Vec<String> = first.call("peers", ()).await.unwrap();
    assert_eq!(peers.len(), 2);
    assert!(peers.contains(&a) && peers.contains(&b));
}

#[tokio::test]
async fn test_broadcast_calls_back_into_other_clients() {
    let (url, port) = demo_server().await;

    let (sender_tx, mut sender_rx) = mpsc::unbounded_channel();
    let sender = connect(&url, notify_routes(sender_tx), RpcOptions::default())
        .await
        .unwrap();

    let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
    let _b = connect(&url, notify_routes(inbox_tx.clone()), RpcOptions::default())
        .await
        .unwrap();
    let _c = connect(&url, notify_routes(inbox_tx), RpcOptions::default())
        .await
        .unwrap();
    assert!(wait_for_connections(port, 3).await);

    let sender_id: String = sender.call("whoami", ()).await.unwrap();
    let acknowledged: usize = sender.call("broadcast", ("hello",)).await.unwrap();
    assert_eq!(acknowledged, 2);

    for _ in 0..2 {
        let (from, message) = inbox_rx.recv().await.unwrap();
        assert_eq!(from, sender_id);
        assert_eq!(message, "hello");
    }
    assert!(sender_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let router = ServerRouter::builder()
        .routes(demo_routes())
        .on_disconnect(move |id, _| {
            let _ = closed_tx.send(id);
        })
        .build();
    let (url, port) = spawn_server(router).await;

    let staying = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();
    let leaving = connect(&url, RouteTable::new(), RpcOptions::default())
        .await
        .unwrap();
    assert!(wait_for_connections(port, 2).await);

    let leaving_id: String = leaving.call("whoami", ()).await.unwrap();
    leaving.close().await;

    let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("disconnect hook fires")
        .unwrap();
    assert_eq!(closed.to_string(), leaving_id);
    assert!(wait_for_connections(port, 1).await);

    let peers: Vec<String> = staying.call("peers", ()).await.unwrap();
    assert!(!peers.contains(&leaving_id));
}

#[tokio::test]
async fn test_server_call_to_departed_client_is_abandoned() {
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let routes = ServerRoutes::new().typed_route("ask_back", move |ctx: ConnectionContext, (): ()| {
        let result_tx = result_tx.clone();
        async move {
            // The client never answers `question`; keep waiting in the background.
            let pending = ctx.client.invoke("question", vec![]);
            tokio::spawn(async move {
                let _ = result_tx.send(pending.await);
            });
            Ok(true)
        }
    });
    let (url, _port) = spawn_server(ServerRouter::builder().routes(routes).build()).await;

    let client = connect(
        &url,
        RouteTable::new().route("question", |_args| async move {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        }),
        RpcOptions::default(),
    )
    .await
    .unwrap();

    let started: bool = client.call("ask_back", ()).await.unwrap();
    assert!(started);
    client.close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), result_rx.recv())
        .await
        .expect("abandoned call resolves")
        .unwrap();
    assert!(matches!(outcome, Err(TbrpcError::ConnectionClosed { .. })));
}

#[tokio::test]
async fn test_foreign_frames_are_ignored_on_the_wire() {
    let (url, _port) = demo_server().await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    for noise in ["not json", r#"{"type":"other","x":1}"#, "[1,2,3]"] {
        socket.send(Message::Text(noise.to_string())).await.unwrap();
    }
    let request = json!({
        "type": "tBRPC",
        "messageType": "request",
        "functionName": "add",
        "args": [20, 22],
        "transactionId": "tx-1"
    });
    socket.send(Message::Text(request.to_string())).await.unwrap();

    let reply = loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(
        reply,
        json!({
            "type": "tBRPC",
            "messageType": "response",
            "result": 42,
            "transactionId": "tx-1"
        })
    );
}
