use crate::{ClientError, Result};
use bytes::Bytes;
use keybus_broker::{ClientOptions, HubHandle};
use keybus_wire::{self as wire, Push, Request, ServerFrame, decode_server_frame};
use rand::RngCore;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

const SEND_QUEUE: usize = 256;

type ReplyResult = std::result::Result<Option<Value>, keybus_wire::ErrorReply>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Exact,
    Prefix,
}

struct PushRoute {
    id: u64,
    kind: RouteKind,
    pattern: String,
    sender: mpsc::UnboundedSender<Push>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyResult>>>,
    routes: Mutex<Vec<PushRoute>>,
    next_route: AtomicU64,
}

/// Loopback client running in the broker's own process.
///
/// Frames arriving on the send queue are parsed exactly as a remote
/// client would parse them: responses resolve the pending request with
/// the matching id, pushes are routed to whichever subscriptions cover
/// their key, and the greeting releases [`LocalClient::wait`].
pub struct LocalClient {
    uid: u64,
    handle: HubHandle,
    shared: Arc<Shared>,
    ready_rx: watch::Receiver<bool>,
}

impl LocalClient {
    /// Register with the hub and start the frame-draining task.
    pub async fn connect(handle: HubHandle, options: ClientOptions) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(SEND_QUEUE);
        let uid = handle
            .register(sender, options)
            .await
            .map_err(|_| ClientError::Closed)?;
        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = watch::channel(false);
        tokio::spawn(run_loop(receiver, Arc::clone(&shared), ready_tx));
        Ok(Self {
            uid,
            handle,
            shared,
            ready_rx,
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Block until the broker's greeting has been seen.
    pub async fn wait(&self) {
        let mut ready = self.ready_rx.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Issue one command and wait for its terminal reply.
    pub async fn request(&self, command: &str, data: Map<String, Value>) -> Result<Option<Value>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = self.enqueue_pending(reply_tx);
        let request = Request::new(command, data).with_request_id(request_id.clone());
        let frame = wire::encode(&request)?;
        if self.handle.incoming(self.uid, frame).await.is_err() {
            self.drop_pending(&request_id);
            return Err(ClientError::Closed);
        }
        match reply_rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(ClientError::Broker(err)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Subscribe to one exact key; matching pushes arrive on the receiver.
    pub async fn subscribe_key(&self, key: &str) -> Result<mpsc::UnboundedReceiver<Push>> {
        self.subscribe(wire::CMD_SUBSCRIBE_KEY, RouteKind::Exact, "key", key)
            .await
    }

    /// Subscribe to a key prefix; matching pushes arrive on the receiver.
    pub async fn subscribe_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Push>> {
        self.subscribe(wire::CMD_SUBSCRIBE_PREFIX, RouteKind::Prefix, "prefix", prefix)
            .await
    }

    pub async fn unsubscribe_key(&self, key: &str) -> Result<()> {
        self.request(wire::CMD_UNSUBSCRIBE_KEY, param_map("key", key))
            .await?;
        self.drop_route(RouteKind::Exact, key);
        Ok(())
    }

    pub async fn unsubscribe_prefix(&self, prefix: &str) -> Result<()> {
        self.request(wire::CMD_UNSUBSCRIBE_PREFIX, param_map("prefix", prefix))
            .await?;
        self.drop_route(RouteKind::Prefix, prefix);
        Ok(())
    }

    /// Deregister from the hub. The drain task ends once the hub drops
    /// the send queue.
    pub async fn close(&self) {
        let _ = self.handle.unregister(self.uid).await;
    }

    async fn subscribe(
        &self,
        command: &str,
        kind: RouteKind,
        param: &str,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Push>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Install the route before asking the broker so no push can slip
        // between the ack and the routing table update.
        let route_id = self.shared.next_route.fetch_add(1, Ordering::Relaxed);
        self.shared
            .routes
            .lock()
            .expect("routes lock")
            .push(PushRoute {
                id: route_id,
                kind,
                pattern: pattern.to_string(),
                sender: tx,
            });
        match self.request(command, param_map(param, pattern)).await {
            Ok(_) => Ok(rx),
            Err(err) => {
                self.shared
                    .routes
                    .lock()
                    .expect("routes lock")
                    .retain(|route| route.id != route_id);
                Err(err)
            }
        }
    }

    fn enqueue_pending(&self, reply: oneshot::Sender<ReplyResult>) -> String {
        let mut pending = self.shared.pending.lock().expect("pending lock");
        let mut rng = rand::thread_rng();
        let request_id = loop {
            let candidate = format!("{:x}", rng.next_u64());
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(request_id.clone(), reply);
        request_id
    }

    fn drop_pending(&self, request_id: &str) {
        self.shared
            .pending
            .lock()
            .expect("pending lock")
            .remove(request_id);
    }

    fn drop_route(&self, kind: RouteKind, pattern: &str) {
        let mut routes = self.shared.routes.lock().expect("routes lock");
        if let Some(index) = routes
            .iter()
            .position(|route| route.kind == kind && route.pattern == pattern)
        {
            routes.remove(index);
        }
    }
}

fn param_map(name: &str, value: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(name.to_string(), json!(value));
    map
}

fn route_matches(kind: RouteKind, pattern: &str, key: &str) -> bool {
    match kind {
        RouteKind::Exact => key == pattern,
        RouteKind::Prefix => key.starts_with(pattern),
    }
}

async fn run_loop(
    mut receiver: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    ready_tx: watch::Sender<bool>,
) {
    while let Some(frame) = receiver.recv().await {
        match decode_server_frame(&frame) {
            Ok(ServerFrame::Hello(hello)) => {
                tracing::debug!(version = %hello.version, "broker greeting");
                let _ = ready_tx.send(true);
            }
            Ok(ServerFrame::Response(response)) => {
                resolve_reply(&shared, &response.request_id, Ok(response.data));
            }
            Ok(ServerFrame::Error(error)) => {
                if error.request_id.is_empty() {
                    tracing::warn!(code = %error.error, details = %error.details,
                        "broker error without request id");
                } else {
                    let request_id = error.request_id.clone();
                    resolve_reply(&shared, &request_id, Err(error));
                }
            }
            Ok(ServerFrame::Push(push)) => route_push(&shared, push),
            Err(err) => {
                tracing::error!(error = %err, "undecodable frame from broker");
            }
        }
    }
}

fn resolve_reply(shared: &Shared, request_id: &str, result: ReplyResult) {
    let reply = shared
        .pending
        .lock()
        .expect("pending lock")
        .remove(request_id);
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => tracing::warn!(request_id, "reply without a pending request"),
    }
}

fn route_push(shared: &Shared, push: Push) {
    let mut routes = shared.routes.lock().expect("routes lock");
    let mut delivered = false;
    // Dead receivers are pruned as they are discovered.
    routes.retain(|route| {
        if !route_matches(route.kind, &route.pattern, &push.key) {
            return true;
        }
        match route.sender.send(push.clone()) {
            Ok(()) => {
                delivered = true;
                true
            }
            Err(_) => false,
        }
    });
    if !delivered {
        tracing::debug!(key = %push.key, "push without a matching subscription");
    }
}
