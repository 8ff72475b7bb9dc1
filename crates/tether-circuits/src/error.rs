//! Circuit error types.

use tether_core::{CircuitId, ErrorKind};
use thiserror::Error;

/// Errors raised by circuits and the circuit registry.
#[derive(Debug, Error)]
pub enum CircuitError {
    /// The circuit has been terminated; the operation was not applied.
    #[error("circuit has been terminated")]
    Terminated,

    /// The command came from a connection that is no longer bound.
    #[error("connection is not bound to this circuit")]
    StaleConnection,

    /// A circuit with this id is already registered.
    #[error("circuit {0} is already registered")]
    AlreadyRegistered(CircuitId),

    /// The operation is not valid in the circuit's current state.
    #[error("invalid circuit state: {0}")]
    InvalidState(String),

    /// A payload sent by the client could not be parsed or validated.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The client added more root components than allowed after start.
    #[error("root component limit of {limit} exceeded")]
    RootComponentLimit {
        /// Configured limit.
        limit: usize,
    },

    /// Initialization was abandoned because the starting connection went away.
    #[error("circuit initialization was cancelled")]
    Cancelled,

    /// Application code failed while running inside the circuit.
    #[error("application fault: {0:#}")]
    Application(anyhow::Error),

    /// An internal invariant failed outside application code.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CircuitError {
    /// Classify this error for the connection boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Terminated | Self::StaleConnection | Self::Cancelled => ErrorKind::StaleReference,
            Self::AlreadyRegistered(_)
            | Self::InvalidState(_)
            | Self::InvalidPayload(_)
            | Self::RootComponentLimit { .. } => ErrorKind::Protocol,
            Self::Application(_) | Self::Internal(_) => ErrorKind::ApplicationFault,
        }
    }
}

/// Result type for circuit operations.
pub type Result<T> = std::result::Result<T, CircuitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_errors_are_protocol() {
        assert_eq!(
            CircuitError::InvalidPayload("bad json".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            CircuitError::RootComponentLimit { limit: 3 }.kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn terminated_is_stale_reference() {
        assert_eq!(CircuitError::Terminated.kind(), ErrorKind::StaleReference);
        assert_eq!(CircuitError::StaleConnection.kind(), ErrorKind::StaleReference);
    }

    #[test]
    fn application_fault_shows_chain() {
        let err = anyhow::anyhow!("inner").context("outer");
        let err = CircuitError::Application(err);
        assert_eq!(err.kind(), ErrorKind::ApplicationFault);
        assert_eq!(err.to_string(), "application fault: outer: inner");
    }
}
