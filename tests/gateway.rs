//! Drives a real shard manager against an in-process gateway.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use ws_gateway::{
    CloseReason, ConnectionConfig, DispatchEvent, GatewayConfig, GatewayHandler, HeartbeatConfig,
    ShardManager, ShardState, Token,
};

type ServerSocket = WebSocketStream<TcpStream>;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connected,
    Disconnected(CloseReason, bool),
    Event(String),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
}

impl GatewayHandler for Recorder {
    async fn on_connect(&self, _connected: bool) {
        let _ = self.tx.send(Seen::Connected);
    }

    async fn on_disconnect(&self, reason: CloseReason, closed: bool) {
        let _ = self.tx.send(Seen::Disconnected(reason, closed));
    }

    async fn on_event(&self, _shard_id: u32, event: DispatchEvent) {
        let _ = self.tx.send(Seen::Event(event.name().to_string()));
    }
}

/// Read frames until one with opcode `op` arrives, skipping heartbeats
async fn expect_op(ws: &mut ServerSocket, op: u64) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client hung up")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            let payload: Value = serde_json::from_str(text.as_str()).unwrap();
            if payload["op"] == op {
                return payload;
            }
            assert_eq!(payload["op"], 1, "unexpected payload {}", payload);
        }
    }
}

/// Wait until the client closes, returning the close code
async fn expect_close(ws: &mut ServerSocket) -> Option<u16> {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await.ok()? {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            _ => return None,
        }
    }
}

async fn send(ws: &mut ServerSocket, payload: Value) {
    ws.send(Message::Text(payload.to_string().into())).await.unwrap();
}

async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Seen>, want: Seen, log: &mut Vec<Seen>) {
    loop {
        let seen = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}, saw {:?}", want, log))
            .expect("handler dropped");
        log.push(seen.clone());
        if seen == want {
            return;
        }
    }
}

fn config(url: &str) -> GatewayConfig {
    GatewayConfig::builder(Token::bot("secret"))
        .gateway_url(url)
        .connection(ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            max_connect_attempts: 3,
            identify_stagger: Duration::ZERO,
        })
        .heartbeat(HeartbeatConfig {
            max_missed_acks: 1,
            jitter_first_beat: false,
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_identify_then_resume_after_reconnect_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("ws://{}", listener.local_addr().unwrap());
    let resume_url = base.clone();

    let server = tokio::spawn(async move {
        // First connection: identify and receive READY, then ask for a reconnect
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        send(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;

        let identify = expect_op(&mut ws, 2).await;
        assert_eq!(identify["d"]["token"], "secret");
        assert_eq!(identify["d"]["shard"], json!([0, 1]));

        send(
            &mut ws,
            json!({
                "op": 0,
                "s": 1,
                "t": "READY",
                "d": {
                    "v": 10,
                    "user": {"id": "80351110224678912", "username": "bot", "bot": true},
                    "guilds": [{"id": "41771983423143937", "unavailable": true}],
                    "session_id": "abc123",
                    "resume_gateway_url": resume_url,
                    "shard": [0, 1]
                }
            }),
        )
        .await;
        send(&mut ws, json!({"op": 7, "d": null})).await;
        let first_close = expect_close(&mut ws).await;

        // Second connection: the shard must resume where it left off
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        send(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;

        let resume = expect_op(&mut ws, 6).await;
        assert_eq!(resume["d"]["token"], "secret");
        assert_eq!(resume["d"]["session_id"], "abc123");
        assert_eq!(resume["d"]["seq"], 1);

        send(&mut ws, json!({"op": 0, "s": 2, "t": "RESUMED", "d": {}})).await;
        let second_close = expect_close(&mut ws).await;
        (first_close, second_close)
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(config(&base), Recorder { tx });
    manager.connect().await.unwrap();

    let mut log = Vec::new();
    wait_for(&mut rx, Seen::Event("READY".to_string()), &mut log).await;
    wait_for(
        &mut rx,
        Seen::Disconnected(CloseReason::UnknownError, false),
        &mut log,
    )
    .await;
    wait_for(&mut rx, Seen::Event("RESUMED".to_string()), &mut log).await;

    assert_eq!(
        log.iter().filter(|s| **s == Seen::Connected).count(),
        2,
        "connected once per full connect, saw {:?}",
        log
    );
    assert_eq!(manager.shard_state(0), Some(ShardState::Connected));
    assert!(manager.is_connected());

    manager.disconnect().await;
    wait_for(&mut rx, Seen::Disconnected(CloseReason::Normal, true), &mut log).await;

    let (first_close, second_close) = server.await.unwrap();
    assert_eq!(first_close, Some(4000));
    assert_eq!(second_close, Some(1000));

    let metrics = manager.metrics();
    assert_eq!(metrics.identifies(), 1);
    assert_eq!(metrics.resumes(), 1);
    assert_eq!(metrics.dispatches(), 2);
}

#[tokio::test]
async fn test_fatal_close_stops_without_asking() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("ws://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        send(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
        expect_op(&mut ws, 2).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed.".into(),
        }))
        .await
        .unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(config(&base), Recorder { tx });
    manager.connect().await.unwrap();

    let mut log = Vec::new();
    wait_for(
        &mut rx,
        Seen::Disconnected(CloseReason::AuthenticationFailed, true),
        &mut log,
    )
    .await;
    assert!(!log.contains(&Seen::Connected));
    assert!(!manager.is_connected());

    server.await.unwrap();
    manager.disconnect().await;
}
