//! Per-connection dispatch context.

use std::sync::Arc;

use tether_circuits::{Circuit, CircuitRegistry, Resolution};
use tracing::debug;

use crate::rpc::errors::RpcError;
use crate::websocket::connection::ClientConnection;

/// Context passed to every method handler. One per connection.
pub struct RpcContext {
    /// Process-wide circuit registry.
    pub circuits: Arc<CircuitRegistry>,
    /// The connection the request arrived on.
    pub connection: Arc<ClientConnection>,
}

impl RpcContext {
    /// Create a context for `connection`.
    pub fn new(circuits: Arc<CircuitRegistry>, connection: Arc<ClientConnection>) -> Self {
        Self {
            circuits,
            connection,
        }
    }

    /// Resolve the circuit bound to this connection.
    ///
    /// Fails with `NOT_STARTED` before start or reconnect, and with
    /// `CIRCUIT_GONE` once the circuit has terminated. Both close the
    /// connection.
    pub fn circuit(&self) -> Result<Circuit, RpcError> {
        let handle = self.connection.handle();
        match self.circuits.handles().resolve(handle.as_ref()) {
            Resolution::Bound(circuit) => Ok(circuit),
            Resolution::NotStarted => {
                debug!(connection_id = %self.connection.id, "operation before circuit start");
                Err(RpcError::NotStarted {
                    message: "Circuit not initialized.".into(),
                })
            }
            Resolution::Gone => {
                debug!(connection_id = %self.connection.id, "circuit behind handle is gone");
                Err(RpcError::CircuitGone {
                    message: "Circuit has been shut down due to error.".into(),
                })
            }
        }
    }
}
