//! End-to-end tests driving a real server with a `WebSocket` client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rws_core::capability::int_arg;
use rws_core::{CapabilityDescriptor, EventSource, Instance, MethodTable, Native, RwsContext};
use rws_server::{RwsServer, ServerConfig};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Default)]
struct Calc;

#[derive(Debug, Default)]
struct Ticker {
    ticks: EventSource,
}

struct TestServer {
    url: String,
    server: RwsServer,
    ticker: Arc<Ticker>,
}

/// Boot a server on an ephemeral port with `calc` and `ticker` registered.
async fn boot(config: ServerConfig) -> TestServer {
    let context = RwsContext::with_builtins();

    let calc = MethodTable::<Calc>::new()
        .factory(|| Ok(Calc))
        .operation("add", &["i64", "i64"], |_, _, args| {
            Ok(Native::wire(int_arg(&args, 0)? + int_arg(&args, 1)?))
        });
    let _ = context.registry().register(
        CapabilityDescriptor::builder("calc", Arc::new(calc))
            .build()
            .unwrap(),
    );

    let ticker = Arc::new(Ticker::default());
    let instance: Instance = ticker.clone();
    let table = MethodTable::<Ticker>::new().event("ticks", &["tick"], |t| &t.ticks);
    let _ = context.registry().register(
        CapabilityDescriptor::builder("ticker", Arc::new(table))
            .instance(instance)
            .build()
            .unwrap(),
    );

    let server = RwsServer::new(config, context);
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        url: format!("ws://{addr}/ws"),
        server,
        ticker,
    }
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn recv(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("recv timed out")
            .expect("stream ended")
            .expect("read failed");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let waited = timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => {}
                _ => return String::new(),
            }
        }
    })
    .await;
    assert!(waited.is_err(), "unexpected frame: {waited:?}");
}

async fn client_id(ws: &mut WsStream) -> String {
    send(ws, json!({"object": "__this__", "method": "getId", "id": "whoami"})).await;
    let reply = recv(ws).await;
    assert_eq!(reply["id"], "whoami");
    reply["result"].as_str().unwrap().to_owned()
}

async fn wait_for_sessions(server: &RwsServer, expected: usize) {
    timeout(TIMEOUT, async {
        while server.context().session_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count never settled");
}

async fn wait_for_connections(server: &RwsServer, expected: usize) {
    timeout(TIMEOUT, async {
        while server.connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

// ── Calls ──

#[tokio::test]
async fn call_returns_result_to_caller() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;

    send(&mut a, json!({"object": "calc", "method": "add", "params": [2, 3], "id": "x"})).await;
    assert_eq!(recv(&mut a).await, json!({"from": "sys", "id": "x", "result": 5}));
}

#[tokio::test]
async fn unknown_method_returns_exception() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;

    send(&mut a, json!({"object": "calc", "method": "mul", "params": [2, 3], "id": 7})).await;
    let reply = recv(&mut a).await;
    assert_eq!(reply["from"], "sys");
    assert_eq!(reply["id"], 7);
    assert!(reply["exception"].as_str().unwrap().contains("mul"));
}

#[tokio::test]
async fn replies_keep_request_order() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;

    for i in 0..20 {
        send(&mut a, json!({"object": "calc", "method": "add", "params": [i, 1], "id": i})).await;
    }
    for i in 0..20 {
        assert_eq!(recv(&mut a).await["id"], i);
    }
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_connection_survives() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;

    a.send(Message::Text("not json".into())).await.unwrap();
    a.send(Message::Text("[1, 2]".into())).await.unwrap();
    assert_eq!(client_id(&mut a).await, "1");
}

// ── Routing ──

#[tokio::test]
async fn broadcast_reaches_everyone_but_sender() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;
    let mut b = connect(&t.url).await;
    let a_id = client_id(&mut a).await;
    let _ = client_id(&mut b).await;

    send(&mut a, json!({"to": "all", "text": "hi"})).await;
    assert_eq!(recv(&mut b).await, json!({"to": "all", "text": "hi", "from": a_id}));
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn direct_message_reaches_only_target() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;
    let mut b = connect(&t.url).await;
    let mut c = connect(&t.url).await;
    let a_id = client_id(&mut a).await;
    let b_id = client_id(&mut b).await;
    let _ = client_id(&mut c).await;

    send(&mut a, json!({"to": b_id, "n": 1})).await;
    let got = recv(&mut b).await;
    assert_eq!(got["from"], a_id.as_str());
    assert_eq!(got["n"], 1);
    assert_silent(&mut c).await;
}

#[tokio::test]
async fn multicast_reaches_group_members() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;
    let mut b = connect(&t.url).await;
    let mut c = connect(&t.url).await;

    for ws in [&mut a, &mut b] {
        send(ws, json!({"object": "__this__", "method": "join", "params": ["room"], "id": "j"})).await;
        assert_eq!(recv(ws).await["result"], Value::Null);
    }
    let _ = client_id(&mut c).await;

    send(&mut c, json!({"to": "#room", "text": "knock"})).await;
    assert_eq!(recv(&mut a).await["text"], "knock");
    assert_eq!(recv(&mut b).await["text"], "knock");

    send(&mut a, json!({"to": "#room", "text": "inside"})).await;
    assert_eq!(recv(&mut b).await["text"], "inside");
    assert_silent(&mut a).await;
    assert_silent(&mut c).await;
}

// ── Events ──

#[tokio::test]
async fn subscribed_events_reach_the_client() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;

    send(
        &mut a,
        json!({"object": "__this__", "method": "subscribe", "id": 1, "params": [
            {"handlerId": "h1", "object": "ticker", "event": "ticks", "action": "tick"}
        ]}),
    )
    .await;
    assert_eq!(recv(&mut a).await, json!({"from": "sys", "id": 1, "result": null}));

    assert_eq!(t.ticker.ticks.fire("tick", Native::wire(42)), 1);
    assert_eq!(recv(&mut a).await, json!({"from": "sys", "id": "h1", "event": 42}));

    drop(a);
    wait_for_sessions(&t.server, 0).await;
    assert_eq!(t.ticker.ticks.subscriber_count(), 0);
}

// ── Lifecycle ──

#[tokio::test]
async fn closing_the_socket_removes_the_session() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;
    let _ = client_id(&mut a).await;
    assert_eq!(t.server.context().session_count(), 1);

    a.close(None).await.unwrap();
    wait_for_sessions(&t.server, 0).await;
}

#[tokio::test]
async fn upgrades_beyond_the_limit_get_503() {
    let t = boot(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let mut a = connect(&t.url).await;
    let _ = client_id(&mut a).await;

    match connect_async(t.url.as_str()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 503);
        }
        Err(e) => panic!("expected 503, got {e}"),
        Ok(_) => panic!("upgrade beyond the limit succeeded"),
    }

    a.close(None).await.unwrap();
    wait_for_connections(&t.server, 0).await;
    let mut b = connect(&t.url).await;
    assert_eq!(client_id(&mut b).await, "2");
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let t = boot(ServerConfig::default()).await;
    let mut a = connect(&t.url).await;
    let _ = client_id(&mut a).await;

    t.server.shutdown().shutdown();
    wait_for_sessions(&t.server, 0).await;
    let end = timeout(TIMEOUT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok());
}
