// Round-trip smoke test over a real WebSocket connection.
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use keybus_broker::{Hub, HubOptions};
use keybus_storage::MemoryBackend;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(password: &str) -> Result<String> {
    let (hub, handle) = Hub::new(
        Box::new(MemoryBackend::new()),
        HubOptions {
            password: password.to_string(),
        },
    );
    tokio::spawn(hub.run());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind")?;
    let addr = listener.local_addr().context("local addr")?;
    let app = keybus_server::build_router(handle);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    Ok(format!("ws://{addr}/"))
}

// The writer coalesces queued frames into one newline-separated text
// message, so the test reader splits them back apart.
struct TestConn {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    buffered: VecDeque<Value>,
}

impl TestConn {
    async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = connect_async(url).await.context("connect")?;
        let mut conn = Self {
            socket,
            buffered: VecDeque::new(),
        };
        let hello = conn.next_frame().await?;
        assert_eq!(hello["type"], json!("hello"));
        Ok(conn)
    }

    async fn send(&mut self, payload: Value) -> Result<()> {
        self.socket
            .send(Message::Text(payload.to_string()))
            .await
            .context("send")
    }

    async fn next_frame(&mut self) -> Result<Value> {
        loop {
            if let Some(frame) = self.buffered.pop_front() {
                return Ok(frame);
            }
            let message = timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .context("receive timed out")?
                .context("connection closed")?
                .context("receive")?;
            if let Message::Text(text) = message {
                for line in text.split('\n').filter(|line| !line.is_empty()) {
                    self.buffered
                        .push_back(serde_json::from_str(line).context("parse frame")?);
                }
            }
        }
    }
}

#[tokio::test]
async fn write_read_and_push_over_websocket() -> Result<()> {
    let url = start_server("").await?;
    let mut writer = TestConn::connect(&url).await?;
    let mut subscriber = TestConn::connect(&url).await?;

    subscriber
        .send(json!({
            "command": "ksub",
            "request_id": "s1",
            "data": {"key": "watched"},
        }))
        .await?;
    let ack = subscriber.next_frame().await?;
    assert_eq!(ack["ok"], json!(true));
    assert_eq!(ack["request_id"], json!("s1"));

    writer
        .send(json!({
            "command": "kset",
            "request_id": "w1",
            "data": {"key": "watched", "data": "seen"},
        }))
        .await?;
    let ack = writer.next_frame().await?;
    assert_eq!(ack["ok"], json!(true));
    assert_eq!(ack["request_id"], json!("w1"));

    let push = subscriber.next_frame().await?;
    assert_eq!(push["type"], json!("push"));
    assert_eq!(push["key"], json!("watched"));
    assert_eq!(push["new_value"], json!("seen"));

    writer
        .send(json!({
            "command": "kget",
            "request_id": "w2",
            "data": {"key": "watched"},
        }))
        .await?;
    let reply = writer.next_frame().await?;
    assert_eq!(reply["data"], json!("seen"));
    Ok(())
}

#[tokio::test]
async fn malformed_payload_gets_a_format_error() -> Result<()> {
    let url = start_server("").await?;
    let mut conn = TestConn::connect(&url).await?;

    conn.socket
        .send(Message::Text("this is not json".to_string()))
        .await
        .context("send")?;
    let reply = conn.next_frame().await?;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"], json!("invalid message format"));
    Ok(())
}

#[tokio::test]
async fn password_is_enforced_over_websocket() -> Result<()> {
    let url = start_server("secret").await?;
    let mut conn = TestConn::connect(&url).await?;

    conn.send(json!({
        "command": "kget",
        "request_id": "r1",
        "data": {"key": "x"},
    }))
    .await?;
    let reply = conn.next_frame().await?;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"], json!("authentication required"));
    Ok(())
}

#[tokio::test]
async fn newline_padded_requests_are_accepted() -> Result<()> {
    let url = start_server("").await?;
    let mut conn = TestConn::connect(&url).await?;

    conn.socket
        .send(Message::Text(
            "\n{\"command\":\"version\",\n\"request_id\":\"v1\"}\n".to_string(),
        ))
        .await
        .context("send")?;
    let reply = conn.next_frame().await?;
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["request_id"], json!("v1"));
    assert_eq!(reply["data"], json!("v9"));
    Ok(())
}
