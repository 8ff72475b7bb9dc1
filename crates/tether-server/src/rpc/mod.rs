//! JSON RPC over WebSocket: envelope types, error codes, method registry,
//! and the circuit method handlers.

pub mod context;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod types;
