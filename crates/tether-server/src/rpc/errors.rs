//! RPC error codes and error type.

use tether_circuits::CircuitError;
use tether_core::ErrorKind;

use super::types::RpcErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Malformed identifier or payload, or an operation invalid for the connection.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// The circuit behind the connection has terminated.
pub const CIRCUIT_GONE: &str = "CIRCUIT_GONE";
/// The connection has not started or reconnected a circuit.
pub const NOT_STARTED: &str = "NOT_STARTED";
/// Method not found in the registry.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// The handler did not finish in time.
pub const TIMEOUT: &str = "TIMEOUT";

/// Whether a response with `code` must be followed by closing the connection.
pub fn closes_connection(code: &str) -> bool {
    matches!(code, PROTOCOL_ERROR | CIRCUIT_GONE | NOT_STARTED)
}

/// Errors returned by method handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The client broke the protocol, including malformed parameters.
    #[error("{message}")]
    Protocol {
        /// Description.
        message: String,
    },

    /// The bound circuit has terminated.
    #[error("{message}")]
    CircuitGone {
        /// Description.
        message: String,
    },

    /// No circuit is bound to the connection.
    #[error("{message}")]
    NotStarted {
        /// Description.
        message: String,
    },

    /// Internal server or application error.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl RpcError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => PROTOCOL_ERROR,
            Self::CircuitGone { .. } => CIRCUIT_GONE,
            Self::NotStarted { .. } => NOT_STARTED,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl From<CircuitError> for RpcError {
    fn from(err: CircuitError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Protocol => Self::Protocol { message },
            ErrorKind::StaleReference => Self::CircuitGone { message },
            // application failures were already reported to the client as JS.Error
            ErrorKind::ApplicationFault | ErrorKind::Timeout => Self::Internal {
                message: "Circuit operation failed.".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        assert_eq!(RpcError::protocol("x").code(), PROTOCOL_ERROR);
        assert_eq!(
            RpcError::NotStarted { message: "x".into() }.code(),
            NOT_STARTED
        );
    }

    #[test]
    fn closing_codes() {
        assert!(closes_connection(PROTOCOL_ERROR));
        assert!(closes_connection(CIRCUIT_GONE));
        assert!(closes_connection(NOT_STARTED));
        assert!(!closes_connection(METHOD_NOT_FOUND));
        assert!(!closes_connection(INTERNAL_ERROR));
        assert!(!closes_connection(TIMEOUT));
    }

    #[test]
    fn circuit_errors_map_by_kind() {
        assert_eq!(RpcError::from(CircuitError::Terminated).code(), CIRCUIT_GONE);
        assert_eq!(
            RpcError::from(CircuitError::StaleConnection).code(),
            CIRCUIT_GONE
        );
        assert_eq!(
            RpcError::from(CircuitError::InvalidPayload("bad".into())).code(),
            PROTOCOL_ERROR
        );
        assert_eq!(
            RpcError::from(CircuitError::RootComponentLimit { limit: 1 }).code(),
            PROTOCOL_ERROR
        );
    }

    #[test]
    fn application_detail_is_not_echoed() {
        let err = RpcError::from(CircuitError::Application(anyhow::anyhow!(
            "db password wrong"
        )));
        assert_eq!(err.code(), INTERNAL_ERROR);
        assert!(!err.to_string().contains("password"));
    }

    #[test]
    fn error_body_carries_message() {
        let body = RpcError::protocol("bad uri").to_error_body();
        assert_eq!(body.code, PROTOCOL_ERROR);
        assert_eq!(body.message, "bad uri");
    }
}
