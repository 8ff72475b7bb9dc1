//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_circuits::ClientProxy;
use tether_core::{ConnectionId, HandleId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::rpc::types::RpcEvent;

/// Frames queued for the connection's write task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized response or event.
    Text(Arc<String>),
    /// Flush what is queued, then close the socket.
    Close,
}

/// A connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Handle of the bound circuit, set by start or reconnect.
    handle: Mutex<Option<HandleId>>,
    /// Send channel to the write task.
    tx: mpsc::Sender<Outbound>,
    /// Outbound side handed to circuits.
    client: ClientProxy,
    /// Fires when the connection goes away.
    cancel: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// When the last frame was received.
    last_seen: Mutex<Instant>,
    /// Count of messages dropped due to a full channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>, client: ClientProxy) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle: Mutex::new(None),
            tx,
            client,
            cancel: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Bind this connection to a circuit handle.
    pub fn bind(&self, handle: HandleId) {
        *self.handle.lock() = Some(handle);
    }

    /// The bound circuit handle, if any.
    pub fn handle(&self) -> Option<HandleId> {
        self.handle.lock().clone()
    }

    /// Outbound proxy for circuits bound to this connection.
    pub fn client(&self) -> ClientProxy {
        self.client.clone()
    }

    /// Token cancelled when the connection closes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mark the connection as gone.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a text message without waiting.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(Outbound::Text(message)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue an event, waiting for room in the channel.
    pub async fn deliver(&self, event: &RpcEvent) -> bool {
        let Ok(json) = serde_json::to_string(event) else {
            return false;
        };
        self.tx.send(Outbound::Text(Arc::new(json))).await.is_ok()
    }

    /// Serialize an event and queue it without waiting.
    pub fn send_event(&self, event: &RpcEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Ask the write task to close the socket once queued frames are sent.
    pub fn request_close(&self) -> bool {
        self.tx.try_send(Outbound::Close).is_ok()
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Duration since the last inbound frame (or connection establishment).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}
