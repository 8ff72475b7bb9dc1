//! Binary transfer handlers. Payloads travel as base64 strings.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_circuits::StreamId;
use tracing::{debug, instrument};

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{decode_base64, encode_base64, parse_params};
use crate::rpc::registry::MethodHandler;
use crate::rpc::types::RpcEvent;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveByteArrayParams {
    id: u64,
    data: String,
}

/// A byte array passed as an interop argument.
pub struct ReceiveByteArrayHandler;

#[async_trait]
impl MethodHandler for ReceiveByteArrayHandler {
    #[instrument(skip_all, fields(method = "ReceiveByteArray", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: ReceiveByteArrayParams = parse_params(params)?;
        let data = decode_base64(&params.data, "data")?;
        let circuit = ctx.circuit()?;
        circuit
            .receive_byte_array(ctx.connection.id.clone(), params.id, data)
            .await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveJsDataChunkParams {
    stream_id: u64,
    chunk_id: u64,
    #[serde(default)]
    data: String,
    #[serde(default)]
    error: Option<String>,
}

/// One chunk of a client upload. `ack: false` means the transfer is over.
pub struct ReceiveJsDataChunkHandler;

#[async_trait]
impl MethodHandler for ReceiveJsDataChunkHandler {
    #[instrument(skip_all, fields(method = "ReceiveJSDataChunk", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: ReceiveJsDataChunkParams = parse_params(params)?;
        let data = decode_base64(&params.data, "data")?;
        let circuit = ctx.circuit()?;
        let ack = circuit
            .receive_js_data_chunk(
                ctx.connection.id.clone(),
                StreamId(params.stream_id),
                params.chunk_id,
                data,
                params.error,
            )
            .await?;
        Ok(json!({ "ack": ack }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendStreamToClientParams {
    stream_id: u64,
}

/// Download a stream the circuit offered. Chunks are pushed as
/// `JS.StreamChunk` events followed by `JS.StreamEnd`, all before the
/// response.
pub struct SendStreamToClientHandler;

#[async_trait]
impl MethodHandler for SendStreamToClientHandler {
    #[instrument(skip_all, fields(method = "SendStreamToClient", connection_id = %ctx.connection.id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let params: SendStreamToClientParams = parse_params(params)?;
        let circuit = ctx.circuit()?;
        let stream_id = StreamId(params.stream_id);
        let Some(chunks) = circuit
            .send_stream_to_client(ctx.connection.id.clone(), stream_id)
            .await?
        else {
            debug!(stream_id = %stream_id, "no outbound stream with this id");
            return Ok(json!({ "found": false, "chunks": 0 }));
        };

        let count = chunks.len();
        for (chunk_id, chunk) in chunks.iter().enumerate() {
            let event = RpcEvent::new(
                "JS.StreamChunk",
                json!({
                    "streamId": stream_id.0,
                    "chunkId": chunk_id,
                    "data": encode_base64(chunk),
                }),
            );
            if !ctx.connection.deliver(&event).await {
                return Err(RpcError::Internal {
                    message: "Connection closed during stream transfer.".into(),
                });
            }
        }
        let _ = ctx
            .connection
            .deliver(&RpcEvent::new("JS.StreamEnd", json!({ "streamId": stream_id.0 })))
            .await;
        Ok(json!({ "found": true, "chunks": count }))
    }
}
