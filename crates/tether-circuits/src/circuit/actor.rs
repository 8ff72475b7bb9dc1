//! The per-circuit actor task.
//!
//! Owns the renderer, pending calls, stream transfers, and render window.
//! Commands are handled strictly one at a time; after each one the actor
//! pulls as many render batches from the renderer as the window allows.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures::future::BoxFuture;
use metrics::counter;
use tether_core::{CircuitId, ConnectionId, ErrorKind, HandleId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{CircuitCommand, ClientMessage, ClientProxy, SettlementTarget};
use super::{CircuitConfig, CircuitFault, CircuitOptions, CircuitState};
use crate::binding::HandleTable;
use crate::error::{CircuitError, Result};
use crate::handler::CircuitHandlers;
use crate::interop::{CallDirection, CallId, CallOutcome, PendingCallTable};
use crate::metrics::CIRCUIT_FAULTS_TOTAL;
use crate::render::{AckOutcome, BatchId, RenderBatchFlowController};
use crate::renderer::{
    Completion, DotNetInvocation, InteropContext, InteropEffect, Renderer, RootComponentOperation,
    StartRequest,
};
use crate::streams::{StreamError, StreamTransfers};

/// Client-visible error text when detailed errors are off.
const GENERIC_ERROR_MESSAGE: &str = "There was an unhandled exception on the current circuit, \
     so this circuit will be terminated. Enable detailed errors in the circuit settings for more details.";

type Reply<T> = oneshot::Sender<Result<T>>;

pub(super) struct CircuitActor {
    id: CircuitId,
    handle_id: HandleId,
    options: CircuitOptions,
    handlers: CircuitHandlers,
    handles: Arc<HandleTable>,
    faults: mpsc::UnboundedSender<CircuitFault>,

    renderer: Box<dyn Renderer>,
    calls: PendingCallTable,
    streams: StreamTransfers,
    flow: RenderBatchFlowController,
    next_batch_id: u64,
    root_components_added: usize,

    client: Option<ClientProxy>,
    state: CircuitState,
    state_tx: watch::Sender<CircuitState>,
    inbox: mpsc::Receiver<CircuitCommand>,
    weak_inbox: mpsc::WeakSender<CircuitCommand>,
}

impl CircuitActor {
    pub(super) fn spawn(
        config: CircuitConfig,
        renderer: Box<dyn Renderer>,
        inbox: mpsc::Receiver<CircuitCommand>,
        weak_inbox: mpsc::WeakSender<CircuitCommand>,
        state_tx: watch::Sender<CircuitState>,
    ) {
        let options = config.options;
        let actor = Self {
            id: config.id,
            handle_id: config.handle_id,
            handlers: config.handlers,
            handles: config.handles,
            faults: config.faults,
            renderer,
            calls: PendingCallTable::new(options.interop_timeout),
            streams: StreamTransfers::new(options.stream_chunk_size, options.max_inbound_stream_length),
            flow: RenderBatchFlowController::new(options.max_unacknowledged_batches),
            next_batch_id: 1,
            root_components_added: 0,
            client: None,
            state: CircuitState::Initializing,
            state_tx,
            inbox,
            weak_inbox,
            options,
        };
        drop(tokio::spawn(actor.run()));
    }

    async fn run(mut self) {
        debug!(circuit_id = %self.id, "circuit actor started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.inbox.recv() => {
                    let Some(cmd) = cmd else {
                        debug!(circuit_id = %self.id, "all circuit handles dropped");
                        self.terminate().await;
                        break;
                    };
                    if self.handle_command(cmd).await.is_break() {
                        break;
                    }
                }
                () = sleep_until_deadline(deadline) => {
                    let now = Instant::now();
                    let _ = self.calls.expire_due(now);
                    let _ = self.streams.expire_due(now);
                }
            }

            if let Err(err) = self.pump_renders() {
                self.fault(err, "Rendering failed.").await;
                break;
            }
        }

        self.inbox.close();
        while let Ok(cmd) = self.inbox.try_recv() {
            cmd.reject(|| CircuitError::Terminated);
        }
        debug!(circuit_id = %self.id, "circuit actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.calls.next_deadline(), self.streams.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn set_state(&mut self, state: CircuitState) {
        self.state = state;
        let _ = self.state_tx.send_replace(state);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: CircuitCommand) -> ControlFlow<()> {
        match cmd {
            CircuitCommand::Initialize {
                client,
                request,
                cancel,
                reply,
            } => self.on_initialize(client, request, cancel, reply).await,
            CircuitCommand::Reconnect { client, reply } => {
                let result = self.on_reconnect(client).await;
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            CircuitCommand::Disconnect { connection_id } => {
                self.on_disconnect(&connection_id).await;
                ControlFlow::Continue(())
            }
            CircuitCommand::UpdateRootComponents {
                origin,
                operations,
                app_state,
                reply,
            } => {
                let result = self.update_root_components(&origin, &operations, app_state.as_deref());
                self.complete(reply, result, "Failed to update root components.")
                    .await
            }
            CircuitCommand::BeginInvokeDotNet {
                origin,
                invocation,
                reply,
            } => {
                let result = self.begin_invoke_dotnet(&origin, invocation);
                self.complete(reply, result, "Interop call failed.").await
            }
            CircuitCommand::EndInvokeJs {
                origin,
                async_handle,
                succeeded,
                result,
                reply,
            } => {
                let result = self.end_invoke_js(&origin, async_handle, succeeded, result);
                self.complete(reply, result, "Invalid interop arguments.")
                    .await
            }
            CircuitCommand::RenderCompleted {
                origin,
                batch_id,
                error,
                reply,
            } => {
                let result = self.render_completed(&origin, batch_id, error.as_deref());
                let context = format!("Failed to complete render batch '{batch_id}'.");
                self.complete(reply, result, &context).await
            }
            CircuitCommand::LocationChanged {
                origin,
                uri,
                state,
                intercepted,
                reply,
            } => {
                let result = self.check_origin(&origin).and_then(|()| {
                    debug!(circuit_id = %self.id, uri = %uri, "location changed");
                    self.with_renderer(|r, ctx| {
                        r.location_changed(ctx, &uri, state.as_deref(), intercepted)
                    })
                });
                let context = format!("Location change to '{uri}' failed.");
                self.complete(reply, result, &context).await
            }
            CircuitCommand::LocationChanging {
                origin,
                call_id,
                uri,
                state,
                intercepted,
                reply,
            } => {
                let result =
                    self.location_changing(&origin, call_id, &uri, state.as_deref(), intercepted);
                self.complete(reply, result, "Location change failed.").await
            }
            CircuitCommand::DispatchBrowserEvent {
                origin,
                descriptor_json,
                args_json,
                reply,
            } => {
                let result = self.dispatch_browser_event(&origin, &descriptor_json, &args_json);
                self.complete(reply, result, "Failed to dispatch event.")
                    .await
            }
            CircuitCommand::ReceiveByteArray {
                origin,
                id,
                data,
                reply,
            } => {
                let result = self
                    .check_origin(&origin)
                    .and_then(|()| self.with_renderer(|r, ctx| r.receive_byte_array(ctx, id, data)));
                self.complete(reply, result, "Failed to receive byte array.")
                    .await
            }
            CircuitCommand::ReceiveJsDataChunk {
                origin,
                stream_id,
                chunk_id,
                data,
                error,
                reply,
            } => {
                let result = self.check_origin(&origin).map(|()| {
                    self.streams
                        .receive_chunk(stream_id, chunk_id, &data, error)
                        .is_ok()
                });
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            CircuitCommand::SendStreamToClient {
                origin,
                stream_id,
                reply,
            } => {
                let result = self
                    .check_origin(&origin)
                    .map(|()| self.streams.take_outbound(stream_id));
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            CircuitCommand::InboundCallCompleted { call_id, outcome } => {
                let _ = self
                    .calls
                    .resolve(CallDirection::ClientToServer, call_id, outcome);
                ControlFlow::Continue(())
            }
            CircuitCommand::CallSettled {
                call_id,
                target,
                outcome,
            } => self.on_call_settled(call_id, target, outcome).await,
            CircuitCommand::StreamSettled { stream_id, result } => {
                match self.with_renderer(|r, ctx| r.on_stream_completed(ctx, stream_id, result)) {
                    Err(CircuitError::Application(err)) => {
                        self.fault(err, "Stream transfer failed.").await;
                        ControlFlow::Break(())
                    }
                    _ => ControlFlow::Continue(()),
                }
            }
            CircuitCommand::Terminate => {
                self.terminate().await;
                ControlFlow::Break(())
            }
        }
    }

    /// Reply to the caller; an application failure terminates the circuit.
    async fn complete<T>(&mut self, reply: Reply<T>, result: Result<T>, context: &str) -> ControlFlow<()> {
        match result {
            Err(CircuitError::Application(err)) => {
                let _ = reply.send(Err(CircuitError::Terminated));
                self.fault(err, context).await;
                ControlFlow::Break(())
            }
            other => {
                let _ = reply.send(other);
                ControlFlow::Continue(())
            }
        }
    }

    fn check_origin(&self, origin: &ConnectionId) -> Result<()> {
        match self.state {
            CircuitState::Initializing => Err(CircuitError::InvalidState(
                "circuit is being invoked prior to initialization".into(),
            )),
            CircuitState::Terminated => Err(CircuitError::Terminated),
            CircuitState::Active | CircuitState::Disconnected => match &self.client {
                Some(client) if client.connection_id() == origin => Ok(()),
                _ => {
                    debug!(
                        circuit_id = %self.id,
                        connection_id = %origin,
                        "dropping command from a connection that is not bound"
                    );
                    Err(CircuitError::StaleConnection)
                }
            },
        }
    }

    /// Call into the renderer and send whatever client work it queued.
    fn with_renderer<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Renderer, &mut InteropContext<'_>) -> anyhow::Result<T>,
    ) -> Result<T> {
        let mut ctx =
            InteropContext::new(&mut self.calls, &mut self.streams, self.options.interop_timeout);
        let result = f(self.renderer.as_mut(), &mut ctx);
        let effects = ctx.into_effects();
        self.apply_effects(effects);
        result.map_err(CircuitError::Application)
    }

    fn apply_effects(&mut self, effects: Vec<InteropEffect>) {
        for effect in effects {
            match effect {
                InteropEffect::InvokeJs {
                    call_id,
                    identifier,
                    args_json,
                    settled,
                } => {
                    self.send_to_client(ClientMessage::BeginInvokeJs {
                        async_handle: call_id,
                        identifier,
                        args_json,
                    });
                    self.watch_call(call_id, SettlementTarget::JsCall, settled);
                }
                InteropEffect::RequestStream {
                    stream_id,
                    total_length,
                    settled,
                } => {
                    self.send_to_client(ClientMessage::RequestStream {
                        stream_id,
                        total_length,
                    });
                    let inbox = self.weak_inbox.clone();
                    drop(tokio::spawn(async move {
                        let Ok(result) = settled.await else { return };
                        if let Some(tx) = inbox.upgrade() {
                            let _ = tx
                                .send(CircuitCommand::StreamSettled { stream_id, result })
                                .await;
                        }
                    }));
                }
            }
        }
    }

    fn send_to_client(&self, message: ClientMessage) {
        match &self.client {
            Some(client) => {
                let _ = client.send(message);
            }
            None => debug!(circuit_id = %self.id, "no client bound, message not sent"),
        }
    }

    /// Feed a call's final outcome back into the inbox.
    fn watch_call(
        &self,
        call_id: CallId,
        target: SettlementTarget,
        settled: oneshot::Receiver<CallOutcome>,
    ) {
        let inbox = self.weak_inbox.clone();
        drop(tokio::spawn(async move {
            let outcome = settled.await.unwrap_or(CallOutcome::CircuitGone);
            if let Some(tx) = inbox.upgrade() {
                let _ = tx
                    .send(CircuitCommand::CallSettled {
                        call_id,
                        target,
                        outcome,
                    })
                    .await;
            }
        }));
    }

    /// Run a deferred result off the actor, tracked as an inbound call.
    fn spawn_deferred<T>(
        &mut self,
        work: BoxFuture<'static, std::result::Result<T, String>>,
        target: SettlementTarget,
        encode: fn(T) -> String,
    ) where
        T: Send + 'static,
    {
        let (call_id, settled) = self.calls.begin_call(CallDirection::ClientToServer, None);
        self.watch_call(call_id, target, settled);
        let inbox = self.weak_inbox.clone();
        drop(tokio::spawn(async move {
            let outcome = match work.await {
                Ok(value) => CallOutcome::Succeeded(encode(value)),
                Err(message) => CallOutcome::Failed(message),
            };
            if let Some(tx) = inbox.upgrade() {
                let _ = tx
                    .send(CircuitCommand::InboundCallCompleted { call_id, outcome })
                    .await;
            }
        }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    async fn on_initialize(
        &mut self,
        client: ClientProxy,
        request: StartRequest,
        cancel: CancellationToken,
        reply: Reply<()>,
    ) -> ControlFlow<()> {
        if self.state != CircuitState::Initializing {
            let _ = reply.send(Err(CircuitError::InvalidState(
                "circuit is already initialized".into(),
            )));
            return ControlFlow::Continue(());
        }

        match self.initialize(client, &request, &cancel).await {
            Ok(()) => {
                let _ = reply.send(Ok(()));
                ControlFlow::Continue(())
            }
            Err(err) => {
                warn!(circuit_id = %self.id, error = %err, "circuit initialization failed");
                if let CircuitError::Application(inner) = &err {
                    let message = self.client_error_message(inner, "");
                    self.notify_client_error(message);
                }
                self.terminate().await;
                let _ = reply.send(Err(err));
                ControlFlow::Break(())
            }
        }
    }

    async fn initialize(
        &mut self,
        client: ClientProxy,
        request: &StartRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let connection_id = client.connection_id().clone();
        info!(circuit_id = %self.id, connection_id = %connection_id, "circuit initialization started");
        self.client = Some(client);

        until_cancelled(cancel, self.handlers.circuit_opened(&self.id))
            .await?
            .map_err(CircuitError::Application)?;
        until_cancelled(cancel, self.handlers.connection_up(&self.id, &connection_id))
            .await?
            .map_err(CircuitError::Application)?;
        if cancel.is_cancelled() {
            return Err(CircuitError::Cancelled);
        }

        self.with_renderer(|r, ctx| r.start(ctx, request))?;
        self.set_state(CircuitState::Active);
        self.pump_renders().map_err(CircuitError::Application)?;

        info!(circuit_id = %self.id, "circuit initialized");
        Ok(())
    }

    async fn on_reconnect(&mut self, client: ClientProxy) -> Result<()> {
        match self.state {
            CircuitState::Disconnected => {}
            // The registry has already moved the circuit; the old connection's
            // disconnect may still be queued behind this command.
            CircuitState::Active => {
                if let Some(old) = self.client.take() {
                    debug!(
                        circuit_id = %self.id,
                        connection_id = %old.connection_id(),
                        "reconnect supersedes bound connection"
                    );
                    if let Err(e) = self.handlers.connection_down(&self.id, old.connection_id()).await {
                        debug!(circuit_id = %self.id, error = %e, "connection down handlers failed");
                    }
                }
            }
            CircuitState::Initializing | CircuitState::Terminated => {
                return Err(CircuitError::InvalidState(format!(
                    "cannot reconnect a circuit that is {:?}",
                    self.state
                )));
            }
        }

        let connection_id = client.connection_id().clone();
        self.flow.mark_all_unsent();
        let replayed = self.flow.len();
        let _ = send_unsent_batches(&mut self.flow, &client);
        self.client = Some(client);
        self.set_state(CircuitState::Active);

        if let Err(e) = self.handlers.connection_up(&self.id, &connection_id).await {
            warn!(circuit_id = %self.id, error = %e, "connection up handlers failed on reconnect");
        }
        info!(
            circuit_id = %self.id,
            connection_id = %connection_id,
            replayed,
            "circuit reconnected"
        );
        Ok(())
    }

    async fn on_disconnect(&mut self, connection_id: &ConnectionId) {
        let bound = self
            .client
            .as_ref()
            .is_some_and(|c| c.connection_id() == connection_id);
        if !bound {
            debug!(
                circuit_id = %self.id,
                connection_id = %connection_id,
                "ignoring disconnect from a connection that is not bound"
            );
            return;
        }

        self.client = None;
        self.set_state(CircuitState::Disconnected);
        info!(circuit_id = %self.id, connection_id = %connection_id, "circuit disconnected");

        if let Err(e) = self.handlers.connection_down(&self.id, connection_id).await {
            debug!(circuit_id = %self.id, error = %e, "connection down handlers failed");
        }
    }

    async fn fault(&mut self, err: anyhow::Error, context: &str) {
        error!(circuit_id = %self.id, error = %format!("{err:#}"), "unhandled exception in circuit");
        counter!(CIRCUIT_FAULTS_TOTAL).increment(1);

        let message = self.client_error_message(&err, context);
        self.notify_client_error(message);

        let _ = self.faults.send(CircuitFault {
            circuit_id: self.id.clone(),
            kind: ErrorKind::ApplicationFault,
            message: format!("{err:#}"),
        });
        self.terminate().await;
    }

    fn client_error_message(&self, err: &anyhow::Error, context: &str) -> String {
        if self.options.detailed_errors {
            format!("{err:?}")
        } else if context.is_empty() {
            GENERIC_ERROR_MESSAGE.to_owned()
        } else {
            format!("{GENERIC_ERROR_MESSAGE} {context}")
        }
    }

    fn notify_client_error(&self, message: String) {
        match &self.client {
            Some(client) if client.is_connected() => {
                debug!(circuit_id = %self.id, "transmitting error to client");
                if !client.send(ClientMessage::Error { message }) {
                    debug!(circuit_id = %self.id, "failed to transmit error to client");
                }
            }
            _ => debug!(circuit_id = %self.id, "client disconnected, error not transmitted"),
        }
    }

    async fn terminate(&mut self) {
        if self.state == CircuitState::Terminated {
            return;
        }
        info!(circuit_id = %self.id, "circuit terminating");
        self.state = CircuitState::Terminated;
        self.handles.clear(&self.handle_id);

        self.report_abandoned_interop();
        let failed_calls = self.calls.fail_all();
        self.streams.abort_all();

        if let Some(client) = self.client.take() {
            if let Err(e) = self
                .handlers
                .connection_down(&self.id, client.connection_id())
                .await
            {
                debug!(circuit_id = %self.id, error = %e, "connection down handlers failed during teardown");
            }
        }
        if let Err(e) = self.handlers.circuit_closed(&self.id).await {
            debug!(circuit_id = %self.id, error = %e, "circuit closed handlers failed during teardown");
        }
        if let Err(e) = self.renderer.dispose() {
            warn!(circuit_id = %self.id, error = %e, "renderer dispose failed");
        }
        self.flow.clear();

        self.inbox.close();
        let _ = self.state_tx.send_replace(CircuitState::Terminated);
        debug!(circuit_id = %self.id, failed_calls, "circuit disposed");
    }

    /// Tell the renderer that its outstanding JS calls and uploads will never
    /// finish. Interop started from these callbacks is discarded.
    fn report_abandoned_interop(&mut self) {
        let calls = self.calls.outstanding(CallDirection::ServerToClient);
        let uploads = self.streams.inbound_ids();
        if calls.is_empty() && uploads.is_empty() {
            return;
        }
        let mut ctx =
            InteropContext::new(&mut self.calls, &mut self.streams, self.options.interop_timeout);
        for call_id in calls {
            if let Err(e) = self
                .renderer
                .on_js_call_completed(&mut ctx, call_id, &CallOutcome::CircuitGone)
            {
                debug!(circuit_id = %self.id, call_id = %call_id, error = %e, "js call teardown callback failed");
            }
        }
        for stream_id in uploads {
            if let Err(e) = self
                .renderer
                .on_stream_completed(&mut ctx, stream_id, Err(StreamError::CircuitGone))
            {
                debug!(circuit_id = %self.id, stream_id = %stream_id, error = %e, "stream teardown callback failed");
            }
        }
        drop(ctx.into_effects());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rendering
    // ─────────────────────────────────────────────────────────────────────

    /// Pull batches from the renderer until it is idle or the window is full.
    fn pump_renders(&mut self) -> anyhow::Result<()> {
        if self.state != CircuitState::Active {
            return Ok(());
        }
        let Some(client) = self.client.as_ref() else {
            return Ok(());
        };
        if !send_unsent_batches(&mut self.flow, client) {
            return Ok(());
        }
        while !self.flow.is_full() {
            let Some(data) = self.renderer.render()? else {
                break;
            };
            let batch_id = BatchId(self.next_batch_id);
            self.next_batch_id += 1;
            let _ = self.flow.try_enqueue(batch_id, data);
            if !send_unsent_batches(&mut self.flow, client) {
                debug!(circuit_id = %self.id, batch_id = %batch_id, "outbound queue full, batch deferred");
                break;
            }
        }
        Ok(())
    }

    fn render_completed(
        &mut self,
        origin: &ConnectionId,
        batch_id: BatchId,
        error: Option<&str>,
    ) -> Result<()> {
        self.check_origin(origin)?;
        match self.flow.acknowledge(batch_id, error) {
            AckOutcome::Released { resumed } => {
                if let Some(error) = error {
                    warn!(circuit_id = %self.id, batch_id = %batch_id, error, "client failed to apply render batch");
                }
                if resumed {
                    debug!(circuit_id = %self.id, "render production resumed");
                }
                self.with_renderer(|r, ctx| r.on_render_completed(ctx, batch_id, error))
            }
            AckOutcome::Stale => {
                debug!(circuit_id = %self.id, batch_id = %batch_id, "duplicate render acknowledgement");
                Ok(())
            }
            AckOutcome::Unknown => {
                warn!(circuit_id = %self.id, batch_id = %batch_id, "acknowledgement for a batch that was never produced");
                Ok(())
            }
            AckOutcome::OutOfOrder { expected } => {
                warn!(
                    circuit_id = %self.id,
                    batch_id = %batch_id,
                    expected = %expected,
                    "out-of-order render acknowledgement"
                );
                Ok(())
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Client operations
    // ─────────────────────────────────────────────────────────────────────

    fn update_root_components(
        &mut self,
        origin: &ConnectionId,
        operations: &[RootComponentOperation],
        app_state: Option<&str>,
    ) -> Result<()> {
        self.check_origin(origin)?;
        let adds = operations.iter().filter(|op| op.is_add()).count();
        if self.root_components_added + adds > self.options.max_root_components {
            return Err(CircuitError::RootComponentLimit {
                limit: self.options.max_root_components,
            });
        }
        self.with_renderer(|r, ctx| r.update_root_components(ctx, operations, app_state))?;
        self.root_components_added += adds;
        Ok(())
    }

    fn begin_invoke_dotnet(&mut self, origin: &ConnectionId, invocation: DotNetInvocation) -> Result<()> {
        self.check_origin(origin)?;
        debug!(
            circuit_id = %self.id,
            call_id = ?invocation.call_id,
            method = %invocation.method_identifier,
            "begin invoke from client"
        );
        let completion = self.with_renderer(|r, ctx| r.invoke_method(ctx, &invocation))?;

        match (completion, invocation.call_id) {
            (Completion::Ready(result), Some(call_id)) => {
                let (succeeded, result) = match result {
                    Ok(value) => (true, value),
                    Err(message) => (false, message),
                };
                self.send_to_client(ClientMessage::EndInvokeDotNet {
                    call_id,
                    succeeded,
                    result,
                });
            }
            (Completion::Deferred(work), Some(call_id)) => {
                self.spawn_deferred(
                    work,
                    SettlementTarget::DotNetInvocation {
                        client_call_id: call_id,
                    },
                    |value| value,
                );
            }
            (Completion::Deferred(work), None) => {
                drop(tokio::spawn(async move {
                    let _ = work.await;
                }));
            }
            (Completion::Ready(_), None) => {}
        }
        Ok(())
    }

    fn end_invoke_js(
        &mut self,
        origin: &ConnectionId,
        async_handle: CallId,
        succeeded: bool,
        result: String,
    ) -> Result<()> {
        self.check_origin(origin)?;
        let outcome = if succeeded {
            debug!(circuit_id = %self.id, call_id = %async_handle, "JS interop call succeeded");
            CallOutcome::Succeeded(result)
        } else {
            debug!(circuit_id = %self.id, call_id = %async_handle, error = %result, "JS interop call failed");
            CallOutcome::Failed(result)
        };
        let _ = self
            .calls
            .resolve(CallDirection::ServerToClient, async_handle, outcome);
        Ok(())
    }

    fn location_changing(
        &mut self,
        origin: &ConnectionId,
        call_id: u64,
        uri: &str,
        state: Option<&str>,
        intercepted: bool,
    ) -> Result<()> {
        self.check_origin(origin)?;
        debug!(circuit_id = %self.id, uri, "location changing");
        let completion =
            self.with_renderer(|r, ctx| r.location_changing(ctx, uri, state, intercepted))?;
        match completion {
            Completion::Ready(result) => {
                let should_continue = result.unwrap_or_else(|message| {
                    warn!(circuit_id = %self.id, uri, error = %message, "navigation check failed");
                    false
                });
                self.send_to_client(ClientMessage::EndLocationChanging {
                    call_id,
                    should_continue,
                });
            }
            Completion::Deferred(work) => {
                self.spawn_deferred(
                    work,
                    SettlementTarget::LocationChanging {
                        client_call_id: call_id,
                    },
                    |allowed: bool| allowed.to_string(),
                );
            }
        }
        Ok(())
    }

    fn dispatch_browser_event(
        &mut self,
        origin: &ConnectionId,
        descriptor_json: &str,
        args_json: &str,
    ) -> Result<()> {
        self.check_origin(origin)?;
        let descriptor: serde_json::Value = serde_json::from_str(descriptor_json)
            .map_err(|e| CircuitError::InvalidPayload(format!("event descriptor: {e}")))?;
        let args: serde_json::Value = serde_json::from_str(args_json)
            .map_err(|e| CircuitError::InvalidPayload(format!("event args: {e}")))?;
        self.with_renderer(|r, ctx| r.dispatch_browser_event(ctx, &descriptor, &args))
    }

    async fn on_call_settled(
        &mut self,
        call_id: CallId,
        target: SettlementTarget,
        outcome: CallOutcome,
    ) -> ControlFlow<()> {
        match target {
            SettlementTarget::JsCall => {
                let result = self.with_renderer(|r, ctx| r.on_js_call_completed(ctx, call_id, &outcome));
                if let Err(CircuitError::Application(err)) = result {
                    self.fault(err, "Interop call failed.").await;
                    return ControlFlow::Break(());
                }
            }
            SettlementTarget::DotNetInvocation { client_call_id } => {
                self.send_to_client(ClientMessage::EndInvokeDotNet {
                    call_id: client_call_id,
                    succeeded: outcome.is_success(),
                    result: outcome.payload().to_owned(),
                });
            }
            SettlementTarget::LocationChanging { client_call_id } => {
                let should_continue = matches!(&outcome, CallOutcome::Succeeded(v) if v == "true");
                if !outcome.is_success() {
                    warn!(circuit_id = %self.id, error = outcome.payload(), "navigation check failed");
                }
                self.send_to_client(ClientMessage::EndLocationChanging {
                    call_id: client_call_id,
                    should_continue,
                });
            }
        }
        ControlFlow::Continue(())
    }
}

/// Resolve `fut` unless `cancel` fires first.
async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CircuitError::Cancelled),
        value = fut => Ok(value),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Hand pending batches to the transport in order. Returns `false` when the
/// outbound queue had no room; the rest are retried on the next pump.
fn send_unsent_batches(flow: &mut RenderBatchFlowController, client: &ClientProxy) -> bool {
    while let Some(batch) = flow.next_unsent() {
        let message = ClientMessage::RenderBatch {
            batch_id: batch.id,
            data: batch.data.clone(),
        };
        if !client.offer(message) {
            return false;
        }
        flow.mark_sent();
    }
    true
}
