//! Actor protocol and the outbound client channel.

use bytes::Bytes;
use tether_core::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{CircuitError, Result};
use crate::interop::{CallId, CallOutcome};
use crate::render::BatchId;
use crate::renderer::{DotNetInvocation, RootComponentOperation, StartRequest};
use crate::streams::{StreamError, StreamId};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages a circuit pushes to its bound client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// A render batch awaiting acknowledgement.
    RenderBatch {
        /// Batch id to acknowledge with `OnRenderCompleted`.
        batch_id: BatchId,
        /// Encoded batch.
        data: Bytes,
    },
    /// Invoke a client function; answer with `EndInvokeJSFromDotNet`.
    BeginInvokeJs {
        /// Correlation id.
        async_handle: CallId,
        /// Function identifier.
        identifier: String,
        /// JSON-encoded arguments.
        args_json: String,
    },
    /// Result of a client-initiated server method call.
    EndInvokeDotNet {
        /// Client correlation id.
        call_id: String,
        /// Whether the call succeeded.
        succeeded: bool,
        /// JSON result or error description.
        result: String,
    },
    /// Whether a pending navigation may proceed.
    EndLocationChanging {
        /// Client correlation id.
        call_id: u64,
        /// `false` cancels the navigation.
        should_continue: bool,
    },
    /// Ask the client to upload stream data with `ReceiveJSDataChunk`.
    RequestStream {
        /// Stream to upload.
        stream_id: StreamId,
        /// Announced length.
        total_length: u64,
    },
    /// The circuit failed and is terminating.
    Error {
        /// Client-visible description.
        message: String,
    },
}

/// Outbound side of the connection currently bound to a circuit.
#[derive(Clone, Debug)]
pub struct ClientProxy {
    connection_id: ConnectionId,
    tx: mpsc::Sender<ClientMessage>,
}

impl ClientProxy {
    /// Proxy for `connection_id` delivering into `tx`.
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { connection_id, tx }
    }

    /// Connection this proxy delivers to.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Whether the connection is still accepting messages.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message the caller will retry itself. Returns `false` if the
    /// connection's queue is full or closed.
    pub(crate) fn offer(&self, message: ClientMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }

    /// Queue a message without waiting. Returns `false` if the connection's
    /// queue is full or closed.
    pub fn send(&self, message: ClientMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "dropping message for client"
                );
                false
            }
        }
    }
}

/// Which client message a settled call produces.
#[derive(Clone, Debug)]
pub(crate) enum SettlementTarget {
    /// Server-to-client call; notify the renderer.
    JsCall,
    /// Deferred server method; answer the client.
    DotNetInvocation { client_call_id: String },
    /// Deferred navigation check; answer the client.
    LocationChanging { client_call_id: u64 },
}

/// Commands processed by a circuit's actor, one at a time.
pub(crate) enum CircuitCommand {
    Initialize {
        client: ClientProxy,
        request: StartRequest,
        cancel: CancellationToken,
        reply: Reply<()>,
    },
    Reconnect {
        client: ClientProxy,
        reply: Reply<()>,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    UpdateRootComponents {
        origin: ConnectionId,
        operations: Vec<RootComponentOperation>,
        app_state: Option<String>,
        reply: Reply<()>,
    },
    BeginInvokeDotNet {
        origin: ConnectionId,
        invocation: DotNetInvocation,
        reply: Reply<()>,
    },
    EndInvokeJs {
        origin: ConnectionId,
        async_handle: CallId,
        succeeded: bool,
        result: String,
        reply: Reply<()>,
    },
    RenderCompleted {
        origin: ConnectionId,
        batch_id: BatchId,
        error: Option<String>,
        reply: Reply<()>,
    },
    LocationChanged {
        origin: ConnectionId,
        uri: String,
        state: Option<String>,
        intercepted: bool,
        reply: Reply<()>,
    },
    LocationChanging {
        origin: ConnectionId,
        call_id: u64,
        uri: String,
        state: Option<String>,
        intercepted: bool,
        reply: Reply<()>,
    },
    DispatchBrowserEvent {
        origin: ConnectionId,
        descriptor_json: String,
        args_json: String,
        reply: Reply<()>,
    },
    ReceiveByteArray {
        origin: ConnectionId,
        id: u64,
        data: Bytes,
        reply: Reply<()>,
    },
    ReceiveJsDataChunk {
        origin: ConnectionId,
        stream_id: StreamId,
        chunk_id: u64,
        data: Bytes,
        error: Option<String>,
        reply: Reply<bool>,
    },
    SendStreamToClient {
        origin: ConnectionId,
        stream_id: StreamId,
        reply: Reply<Option<Vec<Bytes>>>,
    },
    /// A deferred inbound call finished its work.
    InboundCallCompleted {
        call_id: CallId,
        outcome: CallOutcome,
    },
    /// A tracked call received its final outcome.
    CallSettled {
        call_id: CallId,
        target: SettlementTarget,
        outcome: CallOutcome,
    },
    /// An inbound stream finished or failed.
    StreamSettled {
        stream_id: StreamId,
        result: std::result::Result<Bytes, StreamError>,
    },
    Terminate,
}

impl CircuitCommand {
    /// Answer the caller, if any, with `err` without running the command.
    pub(crate) fn reject(self, err: impl Fn() -> CircuitError) {
        match self {
            Self::Initialize { reply, .. }
            | Self::Reconnect { reply, .. }
            | Self::UpdateRootComponents { reply, .. }
            | Self::BeginInvokeDotNet { reply, .. }
            | Self::EndInvokeJs { reply, .. }
            | Self::RenderCompleted { reply, .. }
            | Self::LocationChanged { reply, .. }
            | Self::LocationChanging { reply, .. }
            | Self::DispatchBrowserEvent { reply, .. }
            | Self::ReceiveByteArray { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Self::ReceiveJsDataChunk { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Self::SendStreamToClient { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Self::Disconnect { .. }
            | Self::InboundCallCompleted { .. }
            | Self::CallSettled { .. }
            | Self::StreamSettled { .. }
            | Self::Terminate => {}
        }
    }
}
