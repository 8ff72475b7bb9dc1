//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - **Branded IDs**: `CircuitId`, `ConnectionId`, `HandleId` as newtypes for type safety
//! - **Errors**: [`ErrorKind`], the four-way classification every subsystem error maps onto
//! - **Logging**: `tracing` subscriber setup and a verbosity-gated [`RedactionPolicy`] for secrets

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::ErrorKind;
pub use ids::{CircuitId, ConnectionId, HandleId};
pub use logging::{Redacted, RedactionPolicy};
