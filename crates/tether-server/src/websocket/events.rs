//! Circuit-to-client push events.

use std::sync::Arc;

use serde_json::json;
use tether_circuits::ClientMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::connection::ClientConnection;
use crate::rpc::handlers::encode_base64;
use crate::rpc::types::RpcEvent;

/// Event type sent right after the socket opens.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";
/// Event type sent before the server closes a connection.
pub const CLOSE: &str = "JS.Close";

/// Wire event for a message pushed by a circuit.
pub fn client_event(message: &ClientMessage) -> RpcEvent {
    match message {
        ClientMessage::RenderBatch { batch_id, data } => RpcEvent::new(
            "JS.RenderBatch",
            json!({ "batchId": batch_id.0, "data": encode_base64(data) }),
        ),
        ClientMessage::BeginInvokeJs {
            async_handle,
            identifier,
            args_json,
        } => RpcEvent::new(
            "JS.BeginInvokeJS",
            json!({
                "asyncHandle": async_handle.0,
                "identifier": identifier,
                "argsJson": args_json,
            }),
        ),
        ClientMessage::EndInvokeDotNet {
            call_id,
            succeeded,
            result,
        } => RpcEvent::new(
            "JS.EndInvokeDotNet",
            json!({ "callId": call_id, "succeeded": succeeded, "result": result }),
        ),
        ClientMessage::EndLocationChanging {
            call_id,
            should_continue,
        } => RpcEvent::new(
            "JS.EndLocationChanging",
            json!({ "callId": call_id, "shouldContinue": should_continue }),
        ),
        ClientMessage::RequestStream {
            stream_id,
            total_length,
        } => RpcEvent::new(
            "JS.RequestStream",
            json!({ "streamId": stream_id.0, "totalLength": total_length }),
        ),
        ClientMessage::Error { message } => RpcEvent::new("JS.Error", json!({ "message": message })),
    }
}

/// `JS.Close` with the reason the server is hanging up.
pub fn close_event(reason: &str) -> RpcEvent {
    RpcEvent::new(CLOSE, json!({ "reason": reason }))
}

/// Forward everything circuits push for this connection onto its socket.
///
/// Ends when every sender is gone or the socket stops accepting frames;
/// dropping the receiver then marks the connection's proxy as disconnected.
pub fn spawn_client_forwarder(
    mut messages: mpsc::Receiver<ClientMessage>,
    connection: Arc<ClientConnection>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            if !connection.deliver(&client_event(&message)).await {
                break;
            }
        }
        debug!(connection_id = %connection.id, "client forwarder stopped");
    })
}
