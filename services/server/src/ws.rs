// Per-connection WebSocket pumps bridging the socket and the hub.
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use keybus_broker::{ClientOptions, HubHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};

// Time allowed to write one message to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

// Time allowed between inbound frames; pongs count.
const PONG_WAIT: Duration = Duration::from_secs(60);

// Ping cadence. Must stay under PONG_WAIT.
const PING_PERIOD: Duration = Duration::from_secs(54);

// Maximum inbound message size in bytes.
const MAX_MESSAGE_SIZE: usize = 512_000;

// Outbound queue depth per connection.
const SEND_QUEUE: usize = 256;

pub async fn upgrade(State(handle): State<HubHandle>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_connection(handle, socket))
}

async fn serve_connection(handle: HubHandle, socket: WebSocket) {
    let (sender, receiver) = mpsc::channel(SEND_QUEUE);
    let uid = match handle.register(sender, ClientOptions::default()).await {
        Ok(uid) => uid,
        Err(err) => {
            tracing::warn!(error = %err, "hub rejected websocket connection");
            return;
        }
    };
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(uid, sink, receiver));
    read_pump(&handle, uid, stream).await;
    let _ = handle.unregister(uid).await;
    // Deregistration closes the send queue, which ends the writer.
    let _ = writer.await;
}

// There is at most one reader per connection; every inbound frame goes
// through here, so a single deadline around each read doubles as the
// keepalive watchdog.
async fn read_pump(handle: &HubHandle, uid: u64, mut stream: SplitStream<WebSocket>) {
    loop {
        let message = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                tracing::debug!(client = uid, "read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                tracing::debug!(client = uid, error = %err, "read error");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };
        let payload = match message {
            Message::Text(text) => normalize_payload(text.as_bytes()),
            Message::Binary(bytes) => normalize_payload(&bytes),
            // Control frames only refresh the read deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return,
        };
        if handle.incoming(uid, payload).await.is_err() {
            return;
        }
    }
}

// Single writer per connection. Frames already waiting in the queue are
// folded into the same text message, newline-separated.
async fn write_pump(uid: u64, mut sink: SplitSink<WebSocket, Message>, mut receiver: mpsc::Receiver<Bytes>) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            maybe = receiver.recv() => match maybe {
                Some(frame) => {
                    let coalesced = coalesce(frame, &mut receiver);
                    match timeout(WRITE_WAIT, sink.send(Message::Text(coalesced))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::debug!(client = uid, error = %err, "write error");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(client = uid, "write deadline expired");
                            return;
                        }
                    }
                }
                None => {
                    // The hub closed the queue.
                    let goodbye = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "bye".into(),
                    }));
                    let _ = timeout(WRITE_WAIT, sink.send(goodbye)).await;
                    return;
                }
            },
            _ = ping.tick() => {
                let sent = timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    return;
                }
            }
        }
    }
}

fn coalesce(first: Bytes, receiver: &mut mpsc::Receiver<Bytes>) -> String {
    let mut out = String::from_utf8_lossy(&first).into_owned();
    while let Ok(next) = receiver.try_recv() {
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(&next));
    }
    out
}

/// Inbound frames may arrive with decorative newlines; flatten them so the
/// dispatcher always sees a single-line JSON document.
pub fn normalize_payload(input: &[u8]) -> Bytes {
    let replaced: Vec<u8> = input
        .iter()
        .map(|byte| if *byte == b'\n' { b' ' } else { *byte })
        .collect();
    let start = replaced
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(replaced.len());
    let end = replaced
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |index| index + 1);
    Bytes::copy_from_slice(&replaced[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newlines_become_spaces() {
        let out = normalize_payload(b"{\"command\":\n\"version\"}");
        assert_eq!(&out[..], b"{\"command\": \"version\"}");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let out = normalize_payload(b"  \n {\"command\":\"version\"} \r\n ");
        assert_eq!(&out[..], b"{\"command\":\"version\"}");
    }

    #[test]
    fn whitespace_only_input_becomes_empty() {
        assert!(normalize_payload(b" \n \t ").is_empty());
    }
}
