use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use atrium_types::events::ServerEvent;

/// How long a typing indicator stays alive without a refresh before the
/// gateway emits stop_typing on the sender's behalf.
const TYPING_EXPIRY: Duration = Duration::from_millis(3000);

/// Messages delivered over a connection's targeted channel.
#[derive(Debug)]
pub enum ConnectionSignal {
    /// An event to forward to this client.
    Event(ServerEvent),
    /// A newer connection authenticated as the same user; this connection
    /// must close.
    Replaced,
}

/// Manages all connected clients: the presence table, the per-pair typing
/// timers, and the broadcast channel presence changes fan out on.
///
/// Each instance owns its own state, so multiple dispatchers (e.g. in
/// tests) never share presence.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Presence broadcasts go to every connection.
    broadcast_tx: broadcast::Sender<ServerEvent>,

    /// Presence table: user_id -> (conn_id, targeted sender).
    /// One entry per user; last-authenticated-wins, see register().
    connections: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<ConnectionSignal>)>>,

    /// Typing timers: (sender, receiver) -> (timer_id, task handle).
    /// At most one pending timer per pair at all times.
    typing: Mutex<HashMap<(Uuid, Uuid), (Uuid, JoinHandle<()>)>>,

    typing_expiry: Duration,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_typing_expiry(TYPING_EXPIRY)
    }

    /// Same as new() with a custom quiet period; tests use short expiries.
    pub fn with_typing_expiry(typing_expiry: Duration) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
                typing: Mutex::new(HashMap::new()),
                typing_expiry,
            }),
        }
    }

    /// Subscribe to broadcast events (presence changes).
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection in the presence table, overwriting any prior
    /// entry for the user (last-authenticated-wins). The replaced connection
    /// is told to close so a stale session cannot keep receiving messages
    /// meant for the current one. Re-registering the same connection only
    /// refreshes its sender.
    pub async fn register(
        &self,
        user_id: Uuid,
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<ConnectionSignal>,
    ) {
        let mut connections = self.inner.connections.write().await;
        if let Some((old_conn_id, old_tx)) = connections.insert(user_id, (conn_id, tx)) {
            if old_conn_id != conn_id {
                let _ = old_tx.send(ConnectionSignal::Replaced);
            }
        }
    }

    /// Tear down a connection's presence, but only while it still owns the
    /// entry — a newer connection's registration is left untouched. Cancels
    /// the user's outstanding typing timers and broadcasts user_offline.
    /// Returns true when this call actually took the user offline.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        {
            let mut connections = self.inner.connections.write().await;
            match connections.get(&user_id) {
                Some((cid, _)) if *cid == conn_id => {
                    connections.remove(&user_id);
                }
                _ => return false,
            }
        }

        self.cancel_typing_for(user_id).await;
        self.broadcast(ServerEvent::UserOffline { user_id });
        true
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.connections.read().await.contains_key(&user_id)
    }

    /// Send a targeted event to a specific user. Returns false when the user
    /// has no live connection; callers treat that as "deliver later via
    /// history fetch", never as an error.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&user_id) {
            Some((_, tx)) => tx.send(ConnectionSignal::Event(event)).is_ok(),
            None => false,
        }
    }

    /// Typing indicator: notify the receiver and (re)arm the auto-expiry
    /// timer for the pair. Rapid repeats collapse into a single pending
    /// timer keyed off the last call.
    pub async fn typing_start(&self, sender: Uuid, receiver: Uuid) {
        self.send_to_user(receiver, ServerEvent::Typing { user_id: sender })
            .await;

        let timer_id = Uuid::new_v4();
        let dispatcher = self.clone();
        let expiry = self.inner.typing_expiry;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            dispatcher.expire_typing(sender, receiver, timer_id).await;
        });

        let mut typing = self.inner.typing.lock().await;
        if let Some((_, old)) = typing.insert((sender, receiver), (timer_id, handle)) {
            old.abort();
        }
    }

    /// Explicit stop: cancel the pending timer and notify the receiver
    /// immediately. Idempotent when no timer exists.
    pub async fn typing_stop(&self, sender: Uuid, receiver: Uuid) {
        self.cancel_typing(sender, receiver).await;
        self.send_to_user(receiver, ServerEvent::StopTyping { user_id: sender })
            .await;
    }

    /// Quiet cancellation without a stop_typing push; used when the sender's
    /// message lands and supersedes the indicator.
    pub async fn cancel_typing(&self, sender: Uuid, receiver: Uuid) {
        let mut typing = self.inner.typing.lock().await;
        if let Some((_, handle)) = typing.remove(&(sender, receiver)) {
            handle.abort();
        }
    }

    /// Timer body: emit stop_typing once the quiet period elapses, unless a
    /// refresh replaced this timer while it slept.
    async fn expire_typing(&self, sender: Uuid, receiver: Uuid, timer_id: Uuid) {
        {
            let mut typing = self.inner.typing.lock().await;
            match typing.get(&(sender, receiver)) {
                Some((tid, _)) if *tid == timer_id => {
                    typing.remove(&(sender, receiver));
                }
                _ => return,
            }
        }
        self.send_to_user(receiver, ServerEvent::StopTyping { user_id: sender })
            .await;
    }

    /// Drop every pending timer the user owns as sender. Part of connection
    /// teardown so no timer outlives its connection.
    async fn cancel_typing_for(&self, sender: Uuid) {
        let mut typing = self.inner.typing.lock().await;
        typing.retain(|(s, _), (_, handle)| {
            if *s == sender {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}
