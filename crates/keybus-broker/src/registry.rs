// Connected-client bookkeeping: identifiers, send queues, auth status.
use crate::auth::Challenge;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};

/// Per-connection tunables fixed at registration time.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Prefix transparently applied to every key the client names.
    pub namespace: String,
}

#[derive(Debug)]
struct ClientRecord {
    sender: mpsc::Sender<Bytes>,
    options: ClientOptions,
    // Challenge survives until the next klogin; the authenticated flag is
    // sticky for the lifetime of the connection.
    challenge: Option<Challenge>,
    authenticated: bool,
}

/// Shared map of connected clients keyed by UID.
///
/// Mutations go through the write lock; the read path serves push fan-out
/// and may run concurrently with other readers.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: RwLock<HashMap<u64, ClientRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a client under a fresh random identifier and return it.
    ///
    /// Identifiers are non-zero 63-bit values; collisions with live
    /// clients are resampled.
    pub async fn register(&self, sender: mpsc::Sender<Bytes>, options: ClientOptions) -> u64 {
        let mut guard = self.inner.write().await;
        let mut rng = rand::thread_rng();
        let uid = loop {
            let candidate: u64 = rng.gen_range(1..=i64::MAX as u64);
            if !guard.contains_key(&candidate) {
                break candidate;
            }
        };
        guard.insert(
            uid,
            ClientRecord {
                sender,
                options,
                challenge: None,
                authenticated: false,
            },
        );
        uid
    }

    /// Drop the record; returns false for unknown clients. Dropping the
    /// record releases the hub's end of the send queue.
    pub async fn remove(&self, uid: u64) -> bool {
        self.inner.write().await.remove(&uid).is_some()
    }

    pub async fn contains(&self, uid: u64) -> bool {
        self.inner.read().await.contains_key(&uid)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn sender(&self, uid: u64) -> Option<mpsc::Sender<Bytes>> {
        self.inner
            .read()
            .await
            .get(&uid)
            .map(|record| record.sender.clone())
    }

    pub async fn options(&self, uid: u64) -> Option<ClientOptions> {
        self.inner
            .read()
            .await
            .get(&uid)
            .map(|record| record.options.clone())
    }

    /// Send queue plus namespace in one lookup, for the fan-out path.
    pub async fn push_target(&self, uid: u64) -> Option<(mpsc::Sender<Bytes>, String)> {
        self.inner
            .read()
            .await
            .get(&uid)
            .map(|record| (record.sender.clone(), record.options.namespace.clone()))
    }

    pub async fn set_challenge(&self, uid: u64, challenge: Challenge) -> bool {
        match self.inner.write().await.get_mut(&uid) {
            Some(record) => {
                record.challenge = Some(challenge);
                true
            }
            None => false,
        }
    }

    pub async fn challenge(&self, uid: u64) -> Option<Challenge> {
        self.inner
            .read()
            .await
            .get(&uid)
            .and_then(|record| record.challenge.clone())
    }

    pub async fn set_authenticated(&self, uid: u64, authenticated: bool) -> bool {
        match self.inner.write().await.get_mut(&uid) {
            Some(record) => {
                record.authenticated = authenticated;
                true
            }
            None => false,
        }
    }

    pub async fn authenticated(&self, uid: u64) -> bool {
        self.inner
            .read()
            .await
            .get(&uid)
            .is_some_and(|record| record.authenticated)
    }
}
