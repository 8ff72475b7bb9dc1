//! WebSocket message dispatch: parses incoming text as `RpcRequest` and
//! routes it through the `MethodRegistry`.

use tracing::{debug, instrument, warn};

use crate::rpc::context::RpcContext;
use crate::rpc::errors;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::{RpcRequest, RpcResponse};

/// Result of handling a WebSocket message.
pub struct HandleResult {
    /// Serialized JSON response to send back.
    pub response_json: String,
    /// The method that was called (empty if parse failed).
    pub method: String,
    /// Typed response.
    pub response: RpcResponse,
}

impl HandleResult {
    /// Whether the connection must be closed after this response.
    pub fn closes_connection(&self) -> bool {
        self.response
            .error_code()
            .is_some_and(errors::closes_connection)
    }
}

/// Handle an incoming WebSocket text message.
///
/// Unparseable frames are protocol errors and close the connection.
#[instrument(skip_all, fields(method, connection_id = %ctx.connection.id))]
pub async fn handle_message(
    message: &str,
    registry: &MethodRegistry,
    ctx: &RpcContext,
) -> HandleResult {
    let request: RpcRequest = match serde_json::from_str(message) {
        Ok(r) => r,
        Err(e) => {
            warn!("invalid JSON received");
            let resp =
                RpcResponse::error("unknown", errors::PROTOCOL_ERROR, format!("Invalid JSON: {e}"));
            return finish(String::new(), resp);
        }
    };

    let method = request.method.clone();
    let _ = tracing::Span::current().record("method", method.as_str());
    debug!(method, id = %request.id, "dispatching RPC");

    let response = registry.dispatch(request, ctx).await;
    finish(method, response)
}

fn finish(method: String, response: RpcResponse) -> HandleResult {
    let response_json = serde_json::to_string(&response).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize response");
        String::new()
    });
    HandleResult {
        response_json,
        method,
        response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::register_all;
    use crate::rpc::handlers::test_helpers::{make_test_context, start_params};
    use serde_json::json;

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        register_all(&mut registry);
        registry
    }

    #[tokio::test]
    async fn invalid_json_closes() {
        let t = make_test_context();
        let result = handle_message("{nope", &registry(), &t.ctx).await;
        assert!(result.method.is_empty());
        assert!(!result.response.success);
        assert!(result.closes_connection());
        assert!(result.response_json.contains("PROTOCOL_ERROR"));
    }

    #[tokio::test]
    async fn call_before_start_closes() {
        let t = make_test_context();
        let msg = json!({"id": "1", "method": "OnRenderCompleted", "params": {"batchId": 1}});
        let result = handle_message(&msg.to_string(), &registry(), &t.ctx).await;
        assert_eq!(result.method, "OnRenderCompleted");
        assert_eq!(result.response.error_code(), Some("NOT_STARTED"));
        assert!(result.closes_connection());
    }

    #[tokio::test]
    async fn start_succeeds_and_keeps_connection() {
        let t = make_test_context();
        let msg = json!({"id": "s", "method": "StartCircuit", "params": start_params(&["App"])});
        let result = handle_message(&msg.to_string(), &registry(), &t.ctx).await;
        assert!(result.response.success, "{}", result.response_json);
        assert!(!result.closes_connection());
        let parsed: serde_json::Value = serde_json::from_str(&result.response_json).unwrap();
        assert!(parsed["result"]["circuitId"].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn malformed_params_close_connection() {
        let t = make_test_context();
        let msg = json!({"id": "1", "method": "ConnectCircuit", "params": {}});
        let result = handle_message(&msg.to_string(), &registry(), &t.ctx).await;
        assert_eq!(result.response.error_code(), Some("PROTOCOL_ERROR"));
        assert!(result.closes_connection());
    }

    #[tokio::test]
    async fn unknown_method_keeps_connection() {
        let t = make_test_context();
        let msg = json!({"id": "1", "method": "Nope"});
        let result = handle_message(&msg.to_string(), &registry(), &t.ctx).await;
        assert_eq!(result.response.error_code(), Some("METHOD_NOT_FOUND"));
        assert!(!result.closes_connection());
    }
}
