//! Render acknowledgements and browser events.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tether_circuits::BatchId;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderCompletedParams {
    batch_id: u64,
    #[serde(default)]
    error_message: Option<String>,
}

/// Client acknowledges a render batch.
pub struct RenderCompletedHandler;

#[async_trait]
impl MethodHandler for RenderCompletedHandler {
    #[instrument(skip_all, fields(method = "OnRenderCompleted", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: RenderCompletedParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        circuit
            .render_completed(
                ctx.connection.id.clone(),
                BatchId(params.batch_id),
                params.error_message,
            )
            .await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchBrowserEventParams {
    event_descriptor: String,
    event_args: String,
}

/// Client raises a UI event.
pub struct DispatchBrowserEventHandler;

#[async_trait]
impl MethodHandler for DispatchBrowserEventHandler {
    #[instrument(skip_all, fields(method = "DispatchBrowserEvent", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: DispatchBrowserEventParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        circuit
            .dispatch_browser_event(
                ctx.connection.id.clone(),
                params.event_descriptor,
                params.event_args,
            )
            .await?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::test_helpers::{make_test_context, start};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tether_circuits::ClientMessage;

    fn event(handler: &str) -> Value {
        json!({
            "eventDescriptor": json!({"handler": handler}).to_string(),
            "eventArgs": "{}"
        })
    }

    #[tokio::test]
    async fn ack_then_event_renders_next_batch() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let ClientMessage::RenderBatch { batch_id, .. } = t.next_client_message().await else {
            panic!("expected first batch");
        };

        let result = RenderCompletedHandler
            .handle(Some(json!({"batchId": batch_id.0})), &t.ctx)
            .await
            .unwrap();
        assert_eq!(result, Value::Null);

        let _ = DispatchBrowserEventHandler
            .handle(Some(event("click")), &t.ctx)
            .await
            .unwrap();
        assert_matches!(
            t.next_client_message().await,
            ClientMessage::RenderBatch { batch_id: next, data } if next.0 == batch_id.0 + 1 && data.as_ref() == b"event"
        );
    }

    #[tokio::test]
    async fn unknown_batch_ack_is_tolerated() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let result = RenderCompletedHandler
            .handle(Some(json!({"batchId": 99, "errorMessage": "oops"})), &t.ctx)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_event_json_is_protocol_error() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let err = DispatchBrowserEventHandler
            .handle(
                Some(json!({"eventDescriptor": "{", "eventArgs": "{}"})),
                &t.ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }

    #[tokio::test]
    async fn failing_handler_terminates_circuit() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let _ = t.next_client_message().await;

        let err = DispatchBrowserEventHandler
            .handle(Some(event("explode")), &t.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_GONE");
        assert_matches!(t.next_client_message().await, ClientMessage::Error { .. });

        // later calls see the cleared handle
        let err = DispatchBrowserEventHandler
            .handle(Some(event("click")), &t.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_GONE");
    }
}
