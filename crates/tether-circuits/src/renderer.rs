//! The seam between a circuit and the UI engine that runs inside it.
//!
//! A circuit owns one [`Renderer`] and calls it only from its actor task, so
//! implementations never see concurrent calls. Work a renderer wants the
//! client to perform (JS calls, stream requests) is queued on the
//! [`InteropContext`] passed to each call and sent once the call returns.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tether_core::CircuitId;
use tokio::sync::oneshot;

use crate::error::{CircuitError, Result};
use crate::interop::{CallDirection, CallId, CallOutcome, PendingCallTable};
use crate::render::BatchId;
use crate::streams::{StreamError, StreamId, StreamTransfers};

/// A root component the client asked for when starting the circuit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMarker {
    /// Position of the marker in the page, starting at 0.
    pub sequence: u32,
    /// Opaque component descriptor understood by the renderer.
    pub descriptor: String,
    /// Optional stable key.
    #[serde(default)]
    pub key: Option<String>,
}

/// Parse and validate the initial component list sent with `StartCircuit`.
///
/// Markers must be non-empty and numbered 0, 1, 2, ... in order.
pub fn parse_component_markers(json: &str) -> Result<Vec<ComponentMarker>> {
    let markers: Vec<ComponentMarker> = serde_json::from_str(json)
        .map_err(|e| CircuitError::InvalidPayload(format!("component markers: {e}")))?;
    if markers.is_empty() {
        return Err(CircuitError::InvalidPayload(
            "no root components supplied".into(),
        ));
    }
    for (expected, marker) in markers.iter().enumerate() {
        if marker.sequence as usize != expected {
            return Err(CircuitError::InvalidPayload(format!(
                "component marker out of sequence: expected {expected}, found {}",
                marker.sequence
            )));
        }
        if marker.descriptor.is_empty() {
            return Err(CircuitError::InvalidPayload(
                "component marker without descriptor".into(),
            ));
        }
    }
    Ok(markers)
}

/// Everything needed to start a circuit.
#[derive(Clone, Debug, PartialEq)]
pub struct StartRequest {
    /// Absolute base URI of the application.
    pub base_uri: String,
    /// Absolute URI of the current page; lies under `base_uri`.
    pub uri: String,
    /// Root components to render.
    pub components: Vec<ComponentMarker>,
    /// Persisted application state from prerendering.
    pub app_state: Option<String>,
}

/// One change to the set of root components.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RootComponentOperation {
    /// Add a new root component.
    #[serde(rename_all = "camelCase")]
    Add {
        /// Client-side id of the component's location.
        ssr_component_id: u64,
        /// Component to add.
        marker: ComponentMarker,
    },
    /// Supply new parameters to an existing root component.
    #[serde(rename_all = "camelCase")]
    Update {
        /// Id of the component to update.
        component_id: u64,
        /// New descriptor.
        marker: ComponentMarker,
    },
    /// Remove a root component.
    #[serde(rename_all = "camelCase")]
    Remove {
        /// Id of the component to remove.
        component_id: u64,
    },
}

impl RootComponentOperation {
    /// Whether this operation adds a component.
    pub fn is_add(&self) -> bool {
        matches!(self, Self::Add { .. })
    }
}

/// A server method invocation requested by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DotNetInvocation {
    /// Client correlation id. `None` for fire-and-forget calls.
    pub call_id: Option<String>,
    /// Assembly of a static method, when not invoking on an object.
    pub assembly_name: Option<String>,
    /// Method to invoke.
    pub method_identifier: String,
    /// Target object for instance calls, 0 for static calls.
    #[serde(default)]
    pub dot_net_object_id: u64,
    /// JSON-encoded arguments.
    pub args_json: String,
}

/// A result that is either available now or produced later off the actor.
pub enum Completion<T> {
    /// Result available immediately.
    Ready(std::result::Result<T, String>),
    /// Result computed asynchronously and fed back into the circuit.
    Deferred(BoxFuture<'static, std::result::Result<T, String>>),
}

/// Client work queued by a renderer call.
#[derive(Debug)]
pub(crate) enum InteropEffect {
    InvokeJs {
        call_id: CallId,
        identifier: String,
        args_json: String,
        settled: oneshot::Receiver<CallOutcome>,
    },
    RequestStream {
        stream_id: StreamId,
        total_length: u64,
        settled: oneshot::Receiver<std::result::Result<Bytes, StreamError>>,
    },
}

/// Handle a renderer uses to talk to the client.
pub struct InteropContext<'a> {
    calls: &'a mut PendingCallTable,
    streams: &'a mut StreamTransfers,
    stream_timeout: Duration,
    effects: Vec<InteropEffect>,
}

impl<'a> InteropContext<'a> {
    pub(crate) fn new(
        calls: &'a mut PendingCallTable,
        streams: &'a mut StreamTransfers,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            calls,
            streams,
            stream_timeout,
            effects: Vec::new(),
        }
    }

    /// Invoke a client function. The outcome is delivered later through
    /// [`Renderer::on_js_call_completed`] with the returned id.
    pub fn invoke_js(&mut self, identifier: impl Into<String>, args_json: impl Into<String>) -> CallId {
        self.invoke_js_with_timeout(identifier, args_json, None)
    }

    /// Like [`Self::invoke_js`] with an explicit timeout.
    pub fn invoke_js_with_timeout(
        &mut self,
        identifier: impl Into<String>,
        args_json: impl Into<String>,
        timeout: Option<Duration>,
    ) -> CallId {
        let (call_id, settled) = self.calls.begin_call(CallDirection::ServerToClient, timeout);
        self.effects.push(InteropEffect::InvokeJs {
            call_id,
            identifier: identifier.into(),
            args_json: args_json.into(),
            settled,
        });
        call_id
    }

    /// Ask the client to upload `total_length` bytes. The data arrives via
    /// [`Renderer::on_stream_completed`].
    pub fn request_stream(&mut self, total_length: u64) -> std::result::Result<StreamId, StreamError> {
        let (stream_id, settled) = self.streams.open_inbound(total_length, self.stream_timeout)?;
        self.effects.push(InteropEffect::RequestStream {
            stream_id,
            total_length,
            settled,
        });
        Ok(stream_id)
    }

    /// Offer data for the client to download with `SendStreamToClient`.
    pub fn send_stream(&mut self, data: Bytes) -> StreamId {
        self.streams.register_outbound(data)
    }

    pub(crate) fn into_effects(self) -> Vec<InteropEffect> {
        self.effects
    }
}

/// The UI engine hosted by a circuit.
///
/// Any `Err` returned from these methods is an unhandled application failure
/// and terminates the circuit.
pub trait Renderer: Send {
    /// Start the application and add its root components.
    fn start(&mut self, ctx: &mut InteropContext<'_>, request: &StartRequest) -> anyhow::Result<()>;

    /// Produce the next pending render batch, if any.
    fn render(&mut self) -> anyhow::Result<Option<Bytes>>;

    /// The client applied (or failed to apply) a batch.
    fn on_render_completed(
        &mut self,
        ctx: &mut InteropContext<'_>,
        batch_id: BatchId,
        error: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Add, update, or remove root components.
    fn update_root_components(
        &mut self,
        ctx: &mut InteropContext<'_>,
        operations: &[RootComponentOperation],
        app_state: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Run a server method on behalf of the client.
    fn invoke_method(
        &mut self,
        ctx: &mut InteropContext<'_>,
        invocation: &DotNetInvocation,
    ) -> anyhow::Result<Completion<String>>;

    /// A call started with [`InteropContext::invoke_js`] finished.
    fn on_js_call_completed(
        &mut self,
        ctx: &mut InteropContext<'_>,
        call_id: CallId,
        outcome: &CallOutcome,
    ) -> anyhow::Result<()>;

    /// The client navigated.
    fn location_changed(
        &mut self,
        ctx: &mut InteropContext<'_>,
        uri: &str,
        state: Option<&str>,
        intercepted: bool,
    ) -> anyhow::Result<()>;

    /// The client is about to navigate. Resolve to `false` to cancel.
    fn location_changing(
        &mut self,
        ctx: &mut InteropContext<'_>,
        uri: &str,
        state: Option<&str>,
        intercepted: bool,
    ) -> anyhow::Result<Completion<bool>>;

    /// Deliver a browser event to its handler.
    fn dispatch_browser_event(
        &mut self,
        ctx: &mut InteropContext<'_>,
        descriptor: &serde_json::Value,
        args: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// A byte array sent by the client as an interop argument.
    fn receive_byte_array(
        &mut self,
        ctx: &mut InteropContext<'_>,
        id: u64,
        data: Bytes,
    ) -> anyhow::Result<()>;

    /// A stream requested with [`InteropContext::request_stream`] finished.
    fn on_stream_completed(
        &mut self,
        ctx: &mut InteropContext<'_>,
        stream_id: StreamId,
        result: std::result::Result<Bytes, StreamError>,
    ) -> anyhow::Result<()>;

    /// Release everything. Called once when the circuit terminates.
    fn dispose(&mut self) -> anyhow::Result<()>;
}

/// Creates a renderer for each new circuit.
pub trait RendererFactory: Send + Sync {
    /// Build the renderer for `circuit_id`.
    fn create(&self, circuit_id: &CircuitId) -> Box<dyn Renderer>;
}

impl<F> RendererFactory for F
where
    F: Fn(&CircuitId) -> Box<dyn Renderer> + Send + Sync,
{
    fn create(&self, circuit_id: &CircuitId) -> Box<dyn Renderer> {
        self(circuit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn markers_parse_in_sequence() {
        let json = r#"[{"sequence":0,"descriptor":"App"},{"sequence":1,"descriptor":"Nav","key":"k"}]"#;
        let markers = parse_component_markers(json).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[1].key.as_deref(), Some("k"));
    }

    #[test]
    fn markers_reject_bad_input() {
        assert_matches!(
            parse_component_markers("not json"),
            Err(CircuitError::InvalidPayload(_))
        );
        assert_matches!(
            parse_component_markers("[]"),
            Err(CircuitError::InvalidPayload(_))
        );
        assert_matches!(
            parse_component_markers(r#"[{"sequence":1,"descriptor":"App"}]"#),
            Err(CircuitError::InvalidPayload(m)) if m.contains("out of sequence")
        );
        assert_matches!(
            parse_component_markers(r#"[{"sequence":0,"descriptor":""}]"#),
            Err(CircuitError::InvalidPayload(_))
        );
    }

    #[test]
    fn root_component_operations_are_tagged() {
        let json = r#"[
            {"type":"add","ssrComponentId":1,"marker":{"sequence":0,"descriptor":"A"}},
            {"type":"remove","componentId":7}
        ]"#;
        let ops: Vec<RootComponentOperation> = serde_json::from_str(json).unwrap();
        assert!(ops[0].is_add());
        assert_eq!(ops[1], RootComponentOperation::Remove { component_id: 7 });
    }

    #[test]
    fn context_queues_effects() {
        let mut calls = PendingCallTable::new(Duration::from_secs(60));
        let mut streams = StreamTransfers::new(16, 1024);
        let mut ctx = InteropContext::new(&mut calls, &mut streams, Duration::from_secs(60));

        let call_id = ctx.invoke_js("alert", "[\"hi\"]");
        let stream_id = ctx.request_stream(10).unwrap();
        let _out = ctx.send_stream(Bytes::from_static(b"data"));
        assert!(ctx.request_stream(4096).is_err());

        let effects = ctx.into_effects();
        assert_eq!(effects.len(), 2);
        assert_matches!(&effects[0], InteropEffect::InvokeJs { call_id: id, .. } if *id == call_id);
        assert_matches!(&effects[1], InteropEffect::RequestStream { stream_id: id, .. } if *id == stream_id);
        assert!(calls.contains(call_id));
        assert_eq!(streams.active(), 2);
    }
}
