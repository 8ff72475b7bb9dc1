//! Error classification shared across the circuit subsystem.
//!
//! Concrete error enums live in the crates that raise them; each one maps
//! onto exactly one [`ErrorKind`], which decides how the failure is handled
//! at a connection boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a failure is handled once it reaches an entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed identifier or payload, or an operation that is invalid for
    /// the connection's state. The call is rejected and the connection closed.
    Protocol,
    /// Unhandled failure in application code running inside a circuit. The
    /// circuit is terminated and never retried.
    ApplicationFault,
    /// An interop call or stream transfer did not complete in time. Only the
    /// affected call fails.
    Timeout,
    /// A reference outlived its target: a cleared handle or a superseded
    /// connection. Benign race, logged and the connection closed if relevant.
    StaleReference,
}

impl ErrorKind {
    /// Whether a failure of this kind ends the transport connection.
    pub fn closes_connection(self) -> bool {
        matches!(self, Self::Protocol | Self::StaleReference)
    }

    /// Whether a failure of this kind ends the circuit.
    pub fn terminates_circuit(self) -> bool {
        matches!(self, Self::ApplicationFault)
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::ApplicationFault => "application_fault",
            Self::Timeout => "timeout",
            Self::StaleReference => "stale_reference",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_and_stale_close_the_connection() {
        assert!(ErrorKind::Protocol.closes_connection());
        assert!(ErrorKind::StaleReference.closes_connection());
        assert!(!ErrorKind::Timeout.closes_connection());
        assert!(!ErrorKind::ApplicationFault.closes_connection());
    }

    #[test]
    fn only_application_faults_terminate() {
        assert!(ErrorKind::ApplicationFault.terminates_circuit());
        assert!(!ErrorKind::Protocol.terminates_circuit());
        assert!(!ErrorKind::Timeout.terminates_circuit());
        assert!(!ErrorKind::StaleReference.terminates_circuit());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ApplicationFault).unwrap();
        assert_eq!(json, "\"application_fault\"");
        assert_eq!(ErrorKind::StaleReference.to_string(), "stale_reference");
    }
}
