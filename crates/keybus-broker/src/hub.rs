// Hub actor: serializes every broker-state mutation through one task.
use crate::commands;
use crate::registry::{ClientOptions, ClientRegistry};
use crate::subscriptions::SubscriptionIndex;
use bytes::Bytes;
use keybus_storage::Backend;
use keybus_wire::{self as wire, ErrCode, ErrorReply, Hello, Push, Request, Response};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

const REGISTER_QUEUE: usize = 16;
const INCOMING_QUEUE: usize = 64;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("hub is shut down")]
    Closed,
}

/// Broker-wide options.
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    /// Shared password gating every data command. Empty disables auth.
    pub password: String,
}

/// One inbound frame from a connected client.
#[derive(Debug)]
pub struct IncomingMessage {
    pub uid: u64,
    pub payload: Bytes,
}

struct RegisterRequest {
    sender: mpsc::Sender<Bytes>,
    options: ClientOptions,
    reply: oneshot::Sender<u64>,
}

enum Event {
    Register(RegisterRequest),
    Unregister(u64),
    Incoming(IncomingMessage),
}

/// Clonable producer side of the hub: transports and in-process clients
/// feed registrations and frames through this.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<u64>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    shutdown_tx: watch::Sender<bool>,
}

impl HubHandle {
    /// Register a client send queue and wait for the assigned UID. The
    /// greeting frame is already queued when this returns.
    pub async fn register(&self, sender: mpsc::Sender<Bytes>, options: ClientOptions) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest {
                sender,
                options,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn unregister(&self, uid: u64) -> Result<()> {
        self.unregister_tx
            .send(uid)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Forward one raw frame read from the client's connection.
    pub async fn incoming(&self, uid: u64, payload: Bytes) -> Result<()> {
        self.incoming_tx
            .send(IncomingMessage { uid, payload })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Ask the dispatcher to exit after the event it is processing.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The dispatcher. Owns the backend, the subscription index, and the
/// registry; `run` drains registrations, departures, and commands one at
/// a time so every observable state change is totally ordered.
///
/// ```
/// use keybus_broker::{Hub, HubOptions};
/// use keybus_storage::MemoryBackend;
///
/// let (hub, handle) = Hub::new(Box::new(MemoryBackend::new()), HubOptions::default());
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let join = tokio::spawn(hub.run());
///     handle.shutdown();
///     join.await.expect("join");
/// });
/// ```
pub struct Hub {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) options: HubOptions,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) subscriptions: SubscriptionIndex,
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<u64>,
    incoming_rx: mpsc::Receiver<IncomingMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Hub {
    pub fn new(backend: Box<dyn Backend>, options: HubOptions) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE);
        let (unregister_tx, unregister_rx) = mpsc::channel(REGISTER_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = Self {
            backend,
            options,
            registry: Arc::new(ClientRegistry::new()),
            subscriptions: SubscriptionIndex::new(),
            register_rx,
            unregister_rx,
            incoming_rx,
            shutdown_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            incoming_tx,
            shutdown_tx,
        };
        (hub, handle)
    }

    /// Shared registry view, useful for harnesses that inspect auth state.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Event loop; returns once shut down or all handles are gone.
    pub async fn run(mut self) {
        tracing::info!("hub running");
        while let Some(event) = self.next_event().await {
            match event {
                Event::Register(req) => self.handle_register(req).await,
                Event::Unregister(uid) => self.handle_unregister(uid).await,
                Event::Incoming(msg) => self.handle_incoming(msg).await,
            }
        }
        tracing::info!("hub stopped");
    }

    async fn next_event(&mut self) -> Option<Event> {
        loop {
            tokio::select! {
                maybe = self.register_rx.recv() => return maybe.map(Event::Register),
                maybe = self.unregister_rx.recv() => return maybe.map(Event::Unregister),
                maybe = self.incoming_rx.recv() => return maybe.map(Event::Incoming),
                changed = self.shutdown_rx.changed() => match changed {
                    Ok(()) if !*self.shutdown_rx.borrow() => continue,
                    _ => return None,
                },
            }
        }
    }

    async fn handle_register(&mut self, req: RegisterRequest) {
        let sender = req.sender.clone();
        let uid = self.registry.register(req.sender, req.options).await;
        if let Ok(frame) = wire::encode(&Hello::current()) {
            let _ = sender.send(frame).await;
        }
        tracing::debug!(client = uid, "client registered");
        let _ = req.reply.send(uid);
    }

    async fn handle_unregister(&mut self, uid: u64) {
        // Subscriptions go first so fan-out can never observe a client
        // whose queue is already closed.
        self.subscriptions.unsubscribe_all(uid);
        if self.registry.remove(uid).await {
            tracing::debug!(client = uid, "client unregistered");
        }
    }

    async fn handle_incoming(&mut self, msg: IncomingMessage) {
        let request: Request = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(err) => {
                self.send_error(msg.uid, ErrCode::InvalidFmt, err.to_string(), "")
                    .await;
                return;
            }
        };
        commands::dispatch(self, msg.uid, request).await;
    }

    pub(crate) async fn send_frame(&self, uid: u64, frame: Bytes) {
        let Some(sender) = self.registry.sender(uid).await else {
            tracing::debug!(client = uid, "dropping frame for unknown client");
            return;
        };
        // Responses are never dropped; a slow consumer backpressures us.
        if sender.send(frame).await.is_err() {
            tracing::debug!(client = uid, "client send queue closed");
        }
    }

    pub(crate) async fn respond(&self, uid: u64, request_id: &str, data: Option<Value>) {
        match wire::encode(&Response::ok(request_id, data)) {
            Ok(frame) => self.send_frame(uid, frame).await,
            Err(err) => tracing::error!(error = %err, "failed to encode response"),
        }
    }

    pub(crate) async fn send_error(
        &self,
        uid: u64,
        code: ErrCode,
        details: impl Into<String>,
        request_id: &str,
    ) {
        match wire::encode(&ErrorReply::new(code, details, request_id)) {
            Ok(frame) => self.send_frame(uid, frame).await,
            Err(err) => tracing::error!(error = %err, "failed to encode error reply"),
        }
    }

    /// Fan a change out to every subscriber of `key`.
    ///
    /// Runs synchronously inside the write handler, so all pushes for a
    /// write are queued before the dispatcher touches the next event.
    /// Pushes to a full queue are dropped and counted; vanished clients
    /// are skipped silently.
    pub(crate) async fn key_changed(&self, key: &str, value: &str) {
        for uid in self.subscriptions.subscribers(key) {
            let Some((sender, namespace)) = self.registry.push_target(uid).await else {
                continue;
            };
            let visible = key.strip_prefix(namespace.as_str()).unwrap_or(key);
            let Ok(frame) = wire::encode(&Push::new(visible, value)) else {
                continue;
            };
            match sender.try_send(frame) {
                Ok(()) => {
                    metrics::counter!("keybus_push_delivered_total").increment(1);
                }
                Err(TrySendError::Full(_)) => {
                    metrics::counter!("keybus_push_dropped_total").increment(1);
                    tracing::warn!(client = uid, key, "subscriber queue full, dropping push");
                }
                Err(TrySendError::Closed(_)) => {
                    metrics::counter!("keybus_push_dead_client_total").increment(1);
                }
            }
        }
    }

    pub(crate) async fn namespace(&self, uid: u64) -> String {
        self.registry
            .options(uid)
            .await
            .map(|options| options.namespace)
            .unwrap_or_default()
    }

    /// Gate for data commands. Always passes when no password is set.
    pub(crate) async fn require_auth(&self, uid: u64, request_id: &str) -> bool {
        if self.options.password.is_empty() {
            return true;
        }
        if self.registry.authenticated(uid).await {
            return true;
        }
        self.send_error(uid, ErrCode::AuthRequired, "authentication required", request_id)
            .await;
        false
    }
}
