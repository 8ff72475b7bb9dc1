//! Handlers for every client-invokable circuit method.

pub mod circuit;
pub mod interop;
pub mod navigation;
pub mod render;
pub mod streams;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;

/// Register every protocol method.
pub fn register_all(registry: &mut MethodRegistry) {
    registry.register("StartCircuit", circuit::StartCircuitHandler);
    registry.register("ConnectCircuit", circuit::ConnectCircuitHandler);
    registry.register("UpdateRootComponents", circuit::UpdateRootComponentsHandler);
    registry.register("BeginInvokeDotNetFromJS", interop::BeginInvokeDotNetHandler);
    registry.register("EndInvokeJSFromDotNet", interop::EndInvokeJsHandler);
    registry.register("OnRenderCompleted", render::RenderCompletedHandler);
    registry.register("DispatchBrowserEvent", render::DispatchBrowserEventHandler);
    registry.register("OnLocationChanged", navigation::LocationChangedHandler);
    registry.register("OnLocationChanging", navigation::LocationChangingHandler);
    registry.register("ReceiveByteArray", streams::ReceiveByteArrayHandler);
    registry.register("ReceiveJSDataChunk", streams::ReceiveJsDataChunkHandler);
    registry.register("SendStreamToClient", streams::SendStreamToClientHandler);
}

/// Deserialize the params object into a typed struct. A missing or
/// malformed payload is a protocol error.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = params.ok_or_else(|| RpcError::protocol("Missing params"))?;
    serde_json::from_value(params).map_err(|e| RpcError::protocol(format!("Invalid params: {e}")))
}

/// Decode a base64 binary payload. Malformed data is a protocol error.
pub(crate) fn decode_base64(data: &str, name: &str) -> Result<Bytes, RpcError> {
    STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| RpcError::protocol(format!("Parameter '{name}' is not valid base64: {e}")))
}

/// Encode binary data for the wire.
pub(crate) fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use anyhow::bail;
    use bytes::Bytes;
    use serde_json::json;
    use tether_circuits::{
        BatchId, CallId, CallOutcome, CircuitHandlers, CircuitRegistry, ClientMessage, Completion,
        DotNetInvocation, InteropContext, RegistryOptions, Renderer, RendererFactory,
        RootComponentOperation, SessionIdCodec, StartRequest, StreamError, StreamId,
    };
    use tether_core::{CircuitId, ConnectionId, RedactionPolicy};
    use tokio::sync::mpsc;

    use crate::rpc::context::RpcContext;
    use crate::websocket::connection::Outbound;
    use crate::websocket::connection::tests::make_connection;

    /// Renderer that emits one batch per start component and per event.
    #[derive(Default)]
    pub(crate) struct TestRenderer {
        pending: VecDeque<Bytes>,
    }

    impl Renderer for TestRenderer {
        fn start(&mut self, _ctx: &mut InteropContext<'_>, request: &StartRequest) -> anyhow::Result<()> {
            for marker in &request.components {
                self.pending
                    .push_back(Bytes::from(marker.descriptor.clone().into_bytes()));
            }
            Ok(())
        }

        fn render(&mut self) -> anyhow::Result<Option<Bytes>> {
            Ok(self.pending.pop_front())
        }

        fn on_render_completed(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            _batch_id: BatchId,
            _error: Option<&str>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn update_root_components(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            operations: &[RootComponentOperation],
            _app_state: Option<&str>,
        ) -> anyhow::Result<()> {
            for op in operations {
                if let RootComponentOperation::Add { marker, .. } = op {
                    self.pending
                        .push_back(Bytes::from(marker.descriptor.clone().into_bytes()));
                }
            }
            Ok(())
        }

        fn invoke_method(
            &mut self,
            ctx: &mut InteropContext<'_>,
            invocation: &DotNetInvocation,
        ) -> anyhow::Result<Completion<String>> {
            match invocation.method_identifier.as_str() {
                "Echo" => Ok(Completion::Ready(Ok(invocation.args_json.clone()))),
                "Download" => {
                    let id = ctx.send_stream(Bytes::from_static(b"0123456789"));
                    Ok(Completion::Ready(Ok(id.0.to_string())))
                }
                "Upload" => match ctx.request_stream(4) {
                    Ok(id) => Ok(Completion::Ready(Ok(id.0.to_string()))),
                    Err(e) => Ok(Completion::Ready(Err(e.to_string()))),
                },
                other => Ok(Completion::Ready(Err(format!("no method {other}")))),
            }
        }

        fn on_js_call_completed(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            _call_id: CallId,
            _outcome: &CallOutcome,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn location_changed(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            _uri: &str,
            _state: Option<&str>,
            _intercepted: bool,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn location_changing(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            uri: &str,
            _state: Option<&str>,
            _intercepted: bool,
        ) -> anyhow::Result<Completion<bool>> {
            Ok(Completion::Ready(Ok(!uri.ends_with("/blocked"))))
        }

        fn dispatch_browser_event(
            &mut self,
            ctx: &mut InteropContext<'_>,
            descriptor: &serde_json::Value,
            _args: &serde_json::Value,
        ) -> anyhow::Result<()> {
            match descriptor["handler"].as_str() {
                Some("explode") => bail!("handler exploded"),
                Some("callJs") => {
                    let _ = ctx.invoke_js("app.ping", "[]");
                }
                _ => {}
            }
            self.pending.push_back(Bytes::from_static(b"event"));
            Ok(())
        }

        fn receive_byte_array(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            _id: u64,
            data: Bytes,
        ) -> anyhow::Result<()> {
            self.pending.push_back(data);
            Ok(())
        }

        fn on_stream_completed(
            &mut self,
            _ctx: &mut InteropContext<'_>,
            _stream_id: StreamId,
            result: Result<Bytes, StreamError>,
        ) -> anyhow::Result<()> {
            if let Ok(data) = result {
                self.pending.push_back(data);
            }
            Ok(())
        }

        fn dispose(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn test_registry() -> Arc<CircuitRegistry> {
        let factory: Arc<dyn RendererFactory> =
            Arc::new(|_: &CircuitId| Box::new(TestRenderer::default()) as Box<dyn Renderer>);
        let registry = Arc::new(CircuitRegistry::new(
            SessionIdCodec::new(RedactionPolicy::default()),
            RegistryOptions::default(),
            factory,
            CircuitHandlers::default(),
        ));
        let _ = registry.spawn_fault_listener();
        registry
    }

    pub(crate) struct TestContext {
        pub ctx: RpcContext,
        pub outbound: mpsc::Receiver<Outbound>,
        pub client_rx: mpsc::Receiver<ClientMessage>,
    }

    impl TestContext {
        /// Next message the bound circuit pushed to the client.
        pub async fn next_client_message(&mut self) -> ClientMessage {
            tokio::time::timeout(std::time::Duration::from_secs(5), self.client_rx.recv())
                .await
                .expect("timed out waiting for client message")
                .expect("client channel closed")
        }

        /// Next event queued on the socket, parsed.
        pub fn next_event(&mut self) -> serde_json::Value {
            match self.outbound.try_recv().expect("no outbound frame") {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                Outbound::Close => panic!("unexpected close"),
            }
        }

        pub fn connection_id(&self) -> &ConnectionId {
            &self.ctx.connection.id
        }
    }

    pub(crate) fn make_test_context() -> TestContext {
        make_test_context_with(test_registry())
    }

    pub(crate) fn make_test_context_with(registry: Arc<CircuitRegistry>) -> TestContext {
        let t = make_connection(64);
        TestContext {
            ctx: RpcContext::new(registry, t.connection),
            outbound: t.outbound,
            client_rx: t.client_rx,
        }
    }

    pub(crate) fn start_params(components: &[&str]) -> serde_json::Value {
        let markers: Vec<serde_json::Value> = components
            .iter()
            .enumerate()
            .map(|(i, d)| json!({"sequence": i, "descriptor": d}))
            .collect();
        json!({
            "baseUri": "https://a/",
            "uri": "https://a/x",
            "components": serde_json::to_string(&markers).unwrap(),
        })
    }

    /// Start a circuit on `t` and return its secret.
    pub(crate) async fn start(t: &mut TestContext, components: &[&str]) -> String {
        use crate::rpc::registry::MethodHandler;
        let result = super::circuit::StartCircuitHandler
            .handle(Some(start_params(components)), &t.ctx)
            .await
            .unwrap();
        result["circuitId"].as_str().unwrap().to_owned()
    }
}
