//! Navigation handlers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationChangedParams {
    uri: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    intercepted: bool,
}

/// The client navigated.
pub struct LocationChangedHandler;

#[async_trait]
impl MethodHandler for LocationChangedHandler {
    #[instrument(skip_all, fields(method = "OnLocationChanged", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: LocationChangedParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        circuit
            .location_changed(
                ctx.connection.id.clone(),
                params.uri,
                params.state,
                params.intercepted,
            )
            .await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationChangingParams {
    call_id: u64,
    uri: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    intercepted: bool,
}

/// The client is about to navigate. The verdict arrives later as
/// `JS.EndLocationChanging`.
pub struct LocationChangingHandler;

#[async_trait]
impl MethodHandler for LocationChangingHandler {
    #[instrument(skip_all, fields(method = "OnLocationChanging", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: LocationChangingParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        circuit
            .location_changing(
                ctx.connection.id.clone(),
                params.call_id,
                params.uri,
                params.state,
                params.intercepted,
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

    #[tokio::test]
    async fn location_changed_is_accepted() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let result = LocationChangedHandler
            .handle(
                Some(json!({"uri": "https://a/next", "intercepted": true})),
                &t.ctx,
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn location_changing_verdicts() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let _ = t.next_client_message().await;

        let _ = LocationChangingHandler
            .handle(Some(json!({"callId": 1, "uri": "https://a/ok"})), &t.ctx)
            .await
            .unwrap();
        assert_matches!(
            t.next_client_message().await,
            ClientMessage::EndLocationChanging { call_id: 1, should_continue: true }
        );

        let _ = LocationChangingHandler
            .handle(Some(json!({"callId": 2, "uri": "https://a/blocked"})), &t.ctx)
            .await
            .unwrap();
        assert_matches!(
            t.next_client_message().await,
            ClientMessage::EndLocationChanging { call_id: 2, should_continue: false }
        );
    }

    #[tokio::test]
    async fn location_changing_requires_call_id() {
        let mut t = make_test_context();
        let _ = start(&mut t, &["App"]).await;
        let err = LocationChangingHandler
            .handle(Some(json!({"uri": "https://a/ok"})), &t.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }
}
