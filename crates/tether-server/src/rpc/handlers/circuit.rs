//! Circuit lifecycle handlers: start, connect, update root components.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_circuits::{
    CircuitError, RootComponentOperation, StartRequest, parse_component_markers,
};
use tether_core::ErrorKind;
use tracing::{info, instrument, warn};
use url::Url;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;

const ALREADY_INITIALIZED: &str = "The circuit host is already initialized.";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartCircuitParams {
    base_uri: String,
    uri: String,
    components: String,
    #[serde(default)]
    app_state: Option<String>,
}

/// Whether `page` is `base` or lies below it, comparing whole path segments.
fn is_under(base: &Url, page: &Url) -> bool {
    if base.origin() != page.origin() {
        return false;
    }
    let base_path = base.path();
    let page_path = page.path();
    if base_path.strip_suffix('/') == Some(page_path) {
        return true;
    }
    page_path
        .strip_prefix(base_path)
        .is_some_and(|rest| base_path.ends_with('/') || rest.is_empty() || rest.starts_with('/'))
}

/// Both URIs must be absolute and `uri` must lie under `base_uri`.
fn validate_uris(base_uri: &str, uri: &str) -> Result<(), RpcError> {
    let base = Url::parse(base_uri)
        .map_err(|e| RpcError::protocol(format!("Invalid base URI '{base_uri}': {e}")))?;
    if base.cannot_be_a_base() {
        return Err(RpcError::protocol(format!(
            "Base URI '{base_uri}' cannot be a base"
        )));
    }
    let page =
        Url::parse(uri).map_err(|e| RpcError::protocol(format!("Invalid URI '{uri}': {e}")))?;
    if !is_under(&base, &page) {
        return Err(RpcError::protocol(format!(
            "URI '{uri}' is not under base URI '{base_uri}'"
        )));
    }
    Ok(())
}

/// Start a new circuit on this connection. Returns the session secret.
pub struct StartCircuitHandler;

#[async_trait]
impl MethodHandler for StartCircuitHandler {
    #[instrument(skip_all, fields(method = "StartCircuit", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: StartCircuitParams = parse_params(params)?;
        if ctx.connection.handle().is_some() {
            return Err(RpcError::protocol(ALREADY_INITIALIZED));
        }
        validate_uris(&params.base_uri, &params.uri)?;
        let components = parse_component_markers(&params.components)?;

        let request = StartRequest {
            base_uri: params.base_uri,
            uri: params.uri,
            components,
            app_state: params.app_state,
        };
        let (circuit, session) = ctx
            .circuits
            .create_and_start(ctx.connection.client(), request, ctx.connection.cancel_token())
            .await
            .map_err(start_failure)?;

        ctx.connection.bind(circuit.handle_id().clone());
        info!(circuit_id = %session.id(), "circuit started");
        Ok(json!({ "circuitId": session.secret() }))
    }
}

/// A circuit that fails to start takes the connection down with it.
fn start_failure(err: CircuitError) -> RpcError {
    if err.kind() == ErrorKind::Protocol {
        return err.into();
    }
    warn!(error = %err, "circuit failed to start");
    RpcError::CircuitGone {
        message: "Circuit failed to start.".into(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectCircuitParams {
    circuit_id: String,
}

/// Resume a disconnected circuit. `connected: false` means start fresh.
pub struct ConnectCircuitHandler;

#[async_trait]
impl MethodHandler for ConnectCircuitHandler {
    #[instrument(skip_all, fields(method = "ConnectCircuit", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: ConnectCircuitParams = parse_params(params)?;
        if ctx.connection.handle().is_some() {
            return Err(RpcError::protocol(ALREADY_INITIALIZED));
        }
        match ctx
            .circuits
            .connect(&params.circuit_id, ctx.connection.client())
            .await
        {
            Some(circuit) => {
                ctx.connection.bind(circuit.handle_id().clone());
                info!(circuit_id = %circuit.id(), "circuit reconnected");
                Ok(json!({ "connected": true }))
            }
            None => Ok(json!({ "connected": false })),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRootComponentsParams {
    operations: String,
    #[serde(default)]
    app_state: Option<String>,
}

/// Add, update, or remove root components.
pub struct UpdateRootComponentsHandler;

#[async_trait]
impl MethodHandler for UpdateRootComponentsHandler {
    #[instrument(skip_all, fields(method = "UpdateRootComponents", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: UpdateRootComponentsParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        let operations: Vec<RootComponentOperation> = serde_json::from_str(&params.operations)
            .map_err(|e| CircuitError::InvalidPayload(format!("root component operations: {e}")))?;
        circuit
            .update_root_components(ctx.connection.id.clone(), operations, params.app_state)
            .await?;
        Ok(Value::Null)
    }
}
