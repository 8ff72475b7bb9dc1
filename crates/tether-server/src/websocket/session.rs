//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tether_circuits::{CircuitRegistry, ClientProxy, Resolution};
use tether_core::ConnectionId;
use tether_settings::ServerSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, Outbound};
use super::events::{CONNECTION_ESTABLISHED, close_event, spawn_client_forwarder};
use super::handler::handle_message;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::rpc::context::RpcContext;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::RpcEvent;

/// How long queued frames get to drain before a server-initiated close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames read ahead of dispatch.
const INBOUND_QUEUE: usize = 64;

/// Per-connection limits.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Interval between Ping frames and liveness checks.
    pub heartbeat_interval: Duration,
    /// Silence after which the client is dropped.
    pub heartbeat_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub outbound_queue_capacity: usize,
}

impl From<&ServerSettings> for SessionConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            heartbeat_interval: s.heartbeat_interval(),
            heartbeat_timeout: s.heartbeat_timeout(),
            outbound_queue_capacity: s.outbound_queue_capacity.max(1),
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Sends a `connection.established` event with the connection ID
/// 2. Dispatches requests one at a time, in receipt order
/// 3. Forwards responses and circuit pushes via the send channel
/// 4. Pings the client and drops it after `heartbeat_timeout` of silence
/// 5. Closes the socket after responses with a closing error code
/// 6. On disconnect, parks the bound circuit for reconnection
///
/// The session also ends when `shutdown` fires.
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    registry: Arc<MethodRegistry>,
    circuits: Arc<CircuitRegistry>,
    config: SessionConfig,
    connections: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(config.outbound_queue_capacity);
    let (client_tx, client_rx) = mpsc::channel(config.outbound_queue_capacity);
    let connection = Arc::new(ClientConnection::new(
        connection_id.clone(),
        send_tx,
        ClientProxy::new(connection_id.clone(), client_tx),
    ));
    let cancel = connection.cancel_token();

    let connection_start = Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let _ = connections.fetch_add(1, Ordering::Relaxed);

    let established = RpcEvent::new(
        CONNECTION_ESTABLISHED,
        json!({ "connectionId": connection_id.as_str() }),
    );
    if let Ok(text) = serde_json::to_string(&established) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }

    // Outbound writer with periodic Ping frames.
    let ping_every = config.heartbeat_interval;
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        let _ = ping_interval.tick().await;
        loop {
            tokio::select! {
                frame = send_rx.recv() => match frame {
                    Some(Outbound::Text(text)) => {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let forwarder = spawn_client_forwarder(client_rx, Arc::clone(&connection));

    let heartbeat_conn = Arc::clone(&connection);
    let heartbeat_cancel = cancel.clone();
    let heartbeat = tokio::spawn(async move {
        let result = run_heartbeat(
            Arc::clone(&heartbeat_conn),
            config.heartbeat_interval,
            config.heartbeat_timeout,
            heartbeat_cancel,
        )
        .await;
        if result == HeartbeatResult::TimedOut {
            warn!(
                silent_for = ?heartbeat_conn.last_seen_elapsed(),
                "client unresponsive, disconnecting"
            );
            heartbeat_conn.cancel();
        }
    });

    // Reader: frames are queued so a close is noticed while a request is
    // still being dispatched.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(INBOUND_QUEUE);
    let reader_conn = Arc::clone(&connection);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            reader_conn.mark_alive();
            let text = match msg {
                Message::Text(t) => t.as_str().to_owned(),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(s) => s,
                    Err(_) => {
                        info!(len = data.len(), "received non-UTF8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!("client sent close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if inbound_tx.send(text).await.is_err() {
                break;
            }
        }
        reader_conn.cancel();
    });

    let ctx = RpcContext::new(Arc::clone(&circuits), Arc::clone(&connection));
    let mut closing = false;
    loop {
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shutdown.cancelled() => break,
            text = inbound_rx.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };

        let result = handle_message(&text, &registry, &ctx).await;
        let closes = result.closes_connection();
        if !connection.send(Arc::new(result.response_json)) {
            info!("failed to enqueue response (channel full or closed)");
        }
        if closes {
            let reason = result
                .response
                .error
                .map(|e| e.message)
                .unwrap_or_default();
            debug!(method = %result.method, reason = %reason, "closing connection after error");
            let _ = connection.send_event(&close_event(&reason));
            let _ = connection.request_close();
            closing = true;
            break;
        }
    }

    // Clean up
    connection.cancel();
    if closing && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut outbound).await.is_err() {
        debug!("outbound queue did not drain before close");
    }
    outbound.abort();
    reader.abort();
    forwarder.abort();
    heartbeat.abort();

    if let Some(handle) = connection.handle() {
        match circuits.handles().resolve(Some(&handle)) {
            Resolution::Bound(circuit) => {
                let _ = circuits.disconnect(circuit.id(), &connection.id).await;
            }
            Resolution::Gone => {
                let _ = circuits.handles().release(&handle);
            }
            Resolution::NotStarted => {}
        }
    }

    info!(dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    let _ = connections.fetch_sub(1, Ordering::Relaxed);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}
