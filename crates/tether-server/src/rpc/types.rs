//! Wire-format types for the circuit protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming request from a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Request identifier echoed in the response.
    pub id: String,
    /// Method name (e.g. `StartCircuit`).
    pub method: String,
    /// Optional parameters object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Outgoing response to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoed request identifier.
    pub id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result payload (present when `success == true`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present when `success == false`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Structured error body inside an `RpcResponse`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Machine-readable error code (e.g. `CIRCUIT_GONE`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Server-pushed event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcEvent {
    /// Event type (e.g. `JS.RenderBatch`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Event payload.
    pub data: Value,
}

impl RpcResponse {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(RpcErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Error code, if this is an error response.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

impl RpcEvent {
    /// Create an event stamped with the current UTC time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_without_params() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"id":"1","method":"ConnectCircuit"}"#).unwrap();
        assert_eq!(req.method, "ConnectCircuit");
        assert!(req.params.is_none());
    }

    #[test]
    fn success_response_omits_error() {
        let resp = RpcResponse::success("7", json!({"connected": true}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["result"]["connected"], true);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn error_response_omits_result() {
        let resp = RpcResponse::error("7", "CIRCUIT_GONE", "gone");
        assert_eq!(resp.error_code(), Some("CIRCUIT_GONE"));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], false);
        assert!(v.get("result").is_none());
        assert_eq!(v["error"]["message"], "gone");
    }

    #[test]
    fn event_shape() {
        let event = RpcEvent::new("JS.Close", json!({"reason": "bye"}));
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "JS.Close");
        assert_eq!(v["data"]["reason"], "bye");
        let ts = v["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
