//! Circuits: per-session actors that own UI state.
//!
//! A [`Circuit`] is a cheap-clone handle around the actor's inbox. Every
//! operation is a message, so everything touching a circuit's renderer,
//! pending calls, streams, and render window runs on one task in receipt
//! order, no matter which connection submitted it.

mod actor;
mod messages;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tether_core::{CircuitId, ConnectionId, ErrorKind, HandleId};
use tether_settings::CircuitSettings;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::binding::HandleTable;
use crate::error::{CircuitError, Result};
use crate::handler::CircuitHandlers;
use crate::interop::CallId;
use crate::render::BatchId;
use crate::renderer::{DotNetInvocation, Renderer, RootComponentOperation, StartRequest};
use crate::streams::StreamId;

pub use messages::{ClientMessage, ClientProxy};
pub(crate) use messages::CircuitCommand;

/// Lifecycle state of a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Starting up; not yet published.
    Initializing,
    /// Bound to a connection and producing renders.
    Active,
    /// Waiting for a reconnect; rendering paused.
    Disconnected,
    /// Disposed. Terminal.
    Terminated,
}

/// An unhandled failure reported by a circuit before it terminates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitFault {
    /// Circuit that failed.
    pub circuit_id: CircuitId,
    /// Classification, always an application fault today.
    pub kind: ErrorKind,
    /// Description of the failure.
    pub message: String,
}

/// Per-circuit limits and timeouts.
#[derive(Clone, Debug)]
pub struct CircuitOptions {
    /// Render batches allowed in flight.
    pub max_unacknowledged_batches: usize,
    /// Default interop timeout, also the stream heartbeat timeout.
    pub interop_timeout: Duration,
    /// Root components that may be added after start.
    pub max_root_components: usize,
    /// Send full error text to the client.
    pub detailed_errors: bool,
    /// Outbound stream chunk size.
    pub stream_chunk_size: usize,
    /// Largest inbound stream accepted.
    pub max_inbound_stream_length: u64,
    /// Inbox capacity.
    pub inbox_capacity: usize,
}

impl From<&CircuitSettings> for CircuitOptions {
    fn from(s: &CircuitSettings) -> Self {
        Self {
            max_unacknowledged_batches: s.max_buffered_unacknowledged_render_batches,
            interop_timeout: s.interop_timeout(),
            max_root_components: s.max_root_components,
            detailed_errors: s.detailed_errors,
            stream_chunk_size: s.stream_chunk_size,
            max_inbound_stream_length: s.max_inbound_stream_length,
            inbox_capacity: s.inbox_capacity,
        }
    }
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self::from(&CircuitSettings::default())
    }
}

/// Everything an actor needs besides its renderer.
pub struct CircuitConfig {
    /// Circuit id.
    pub id: CircuitId,
    /// Handle connections will hold for this circuit.
    pub handle_id: HandleId,
    /// Limits and timeouts.
    pub options: CircuitOptions,
    /// Lifecycle hooks.
    pub handlers: CircuitHandlers,
    /// Shared handle table, cleared on termination.
    pub handles: Arc<HandleTable>,
    /// Where unhandled failures are published.
    pub faults: mpsc::UnboundedSender<CircuitFault>,
}

/// Handle to a running circuit.
#[derive(Clone)]
pub struct Circuit {
    id: CircuitId,
    handle_id: HandleId,
    tx: mpsc::Sender<CircuitCommand>,
    state: watch::Receiver<CircuitState>,
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("handle_id", &self.handle_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Circuit {
    /// Spawn the actor for a new circuit. The circuit starts in
    /// [`CircuitState::Initializing`]; call [`Circuit::initialize`] next.
    pub fn spawn(config: CircuitConfig, renderer: Box<dyn Renderer>) -> Self {
        let (tx, rx) = mpsc::channel(config.options.inbox_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(CircuitState::Initializing);
        let circuit = Self {
            id: config.id.clone(),
            handle_id: config.handle_id.clone(),
            tx: tx.clone(),
            state: state_rx,
        };
        actor::CircuitActor::spawn(config, renderer, rx, tx.downgrade(), state_tx);
        circuit
    }

    /// Circuit id.
    pub fn id(&self) -> &CircuitId {
        &self.id
    }

    /// Handle id connections store for this circuit.
    pub fn handle_id(&self) -> &HandleId {
        &self.handle_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CircuitState {
        *self.state.borrow()
    }

    /// Whether the circuit has terminated.
    pub fn is_terminated(&self) -> bool {
        self.state() == CircuitState::Terminated
    }

    /// Wait until the circuit has terminated.
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == CircuitState::Terminated).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> CircuitCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CircuitError::Terminated)?;
        rx.await.map_err(|_| CircuitError::Terminated)?
    }

    /// Run startup and the first render with `client` bound.
    ///
    /// Fails if the circuit was already initialized, if `cancel` fires before
    /// startup completes, or if application code fails. On failure the
    /// circuit terminates.
    pub async fn initialize(
        &self,
        client: ClientProxy,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::Initialize {
            client,
            request,
            cancel,
            reply,
        })
        .await
    }

    /// Bind a new connection to a disconnected circuit and replay every
    /// unacknowledged render batch to it.
    pub async fn reconnect(&self, client: ClientProxy) -> Result<()> {
        self.request(|reply| CircuitCommand::Reconnect { client, reply })
            .await
    }

    /// Unbind `connection_id`. Ignored unless it is the bound connection.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<()> {
        self.tx
            .send(CircuitCommand::Disconnect { connection_id })
            .await
            .map_err(|_| CircuitError::Terminated)
    }

    /// Ask the circuit to terminate. Returns once the request is queued.
    pub async fn terminate(&self) {
        let _ = self.tx.send(CircuitCommand::Terminate).await;
    }

    /// Apply root component changes.
    pub async fn update_root_components(
        &self,
        origin: ConnectionId,
        operations: Vec<RootComponentOperation>,
        app_state: Option<String>,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::UpdateRootComponents {
            origin,
            operations,
            app_state,
            reply,
        })
        .await
    }

    /// Start a server method call requested by the client.
    pub async fn begin_invoke_dotnet(
        &self,
        origin: ConnectionId,
        invocation: DotNetInvocation,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::BeginInvokeDotNet {
            origin,
            invocation,
            reply,
        })
        .await
    }

    /// Deliver the client's answer to a server-initiated JS call.
    pub async fn end_invoke_js(
        &self,
        origin: ConnectionId,
        async_handle: CallId,
        succeeded: bool,
        result: String,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::EndInvokeJs {
            origin,
            async_handle,
            succeeded,
            result,
            reply,
        })
        .await
    }

    /// Acknowledge a render batch.
    pub async fn render_completed(
        &self,
        origin: ConnectionId,
        batch_id: BatchId,
        error: Option<String>,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::RenderCompleted {
            origin,
            batch_id,
            error,
            reply,
        })
        .await
    }

    /// Notify the circuit that the client navigated.
    pub async fn location_changed(
        &self,
        origin: ConnectionId,
        uri: String,
        state: Option<String>,
        intercepted: bool,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::LocationChanged {
            origin,
            uri,
            state,
            intercepted,
            reply,
        })
        .await
    }

    /// Ask whether a navigation may proceed. The answer is pushed later as
    /// [`ClientMessage::EndLocationChanging`].
    pub async fn location_changing(
        &self,
        origin: ConnectionId,
        call_id: u64,
        uri: String,
        state: Option<String>,
        intercepted: bool,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::LocationChanging {
            origin,
            call_id,
            uri,
            state,
            intercepted,
            reply,
        })
        .await
    }

    /// Deliver a browser event.
    pub async fn dispatch_browser_event(
        &self,
        origin: ConnectionId,
        descriptor_json: String,
        args_json: String,
    ) -> Result<()> {
        self.request(|reply| CircuitCommand::DispatchBrowserEvent {
            origin,
            descriptor_json,
            args_json,
            reply,
        })
        .await
    }

    /// Deliver a byte array interop argument.
    pub async fn receive_byte_array(&self, origin: ConnectionId, id: u64, data: Bytes) -> Result<()> {
        self.request(|reply| CircuitCommand::ReceiveByteArray {
            origin,
            id,
            data,
            reply,
        })
        .await
    }

    /// Deliver one chunk of an inbound stream. Returns the heartbeat ack.
    pub async fn receive_js_data_chunk(
        &self,
        origin: ConnectionId,
        stream_id: StreamId,
        chunk_id: u64,
        data: Bytes,
        error: Option<String>,
    ) -> Result<bool> {
        self.request(|reply| CircuitCommand::ReceiveJsDataChunk {
            origin,
            stream_id,
            chunk_id,
            data,
            error,
            reply,
        })
        .await
    }

    /// Take an outbound stream, split into chunks. `None` for unknown ids.
    pub async fn send_stream_to_client(
        &self,
        origin: ConnectionId,
        stream_id: StreamId,
    ) -> Result<Option<Vec<Bytes>>> {
        self.request(|reply| CircuitCommand::SendStreamToClient {
            origin,
            stream_id,
            reply,
        })
        .await
    }

    /// Handle with no actor behind it, for tests that only need identity.
    #[cfg(test)]
    pub(crate) fn detached(
        id: CircuitId,
        handle_id: HandleId,
    ) -> (Self, mpsc::Receiver<CircuitCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let (_state_tx, state) = watch::channel(CircuitState::Active);
        (
            Self {
                id,
                handle_id,
                tx,
                state,
            },
            rx,
        )
    }
}
