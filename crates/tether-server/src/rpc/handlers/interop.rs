//! JS interop handlers, in both directions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tether_circuits::{CallId, DotNetInvocation};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;

/// Client calls a server method. The result arrives later as
/// `JS.EndInvokeDotNet` when the client supplied a `callId`.
pub struct BeginInvokeDotNetHandler;

#[async_trait]
impl MethodHandler for BeginInvokeDotNetHandler {
    #[instrument(skip_all, fields(method = "BeginInvokeDotNetFromJS", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let invocation: DotNetInvocation = parse_params(params)?;
        let circuit = ctx.circuit()?;
        circuit
            .begin_invoke_dotnet(ctx.connection.id.clone(), invocation)
            .await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndInvokeJsParams {
    async_handle: u64,
    succeeded: bool,
    #[serde(default)]
    result: String,
}

/// Client answers a `JS.BeginInvokeJS` call.
pub struct EndInvokeJsHandler;

#[async_trait]
impl MethodHandler for EndInvokeJsHandler {
    #[instrument(skip_all, fields(method = "EndInvokeJSFromDotNet", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: EndInvokeJsParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        circuit
            .end_invoke_js(
                ctx.connection.id.clone(),
                CallId(params.async_handle),
                params.succeeded,
                params.result,
            )
            .await?;
        Ok(Value::Null)
    }
}
