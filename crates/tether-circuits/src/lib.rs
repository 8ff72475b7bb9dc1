//! # tether-circuits
//!
//! Server-held interactive sessions ("circuits") and their lifecycle.
//!
//! - **Session ids**: [`SessionIdCodec`] mints signed reconnection secrets
//! - **Circuits**: one actor task per circuit serializes every operation
//! - **Backpressure**: [`RenderBatchFlowController`] bounds unacknowledged render batches
//! - **Interop**: [`PendingCallTable`] correlates calls and enforces timeouts
//! - **Streams**: chunked binary transfers with pooled, zeroed buffers
//! - **Registry**: [`CircuitRegistry`] parks disconnected circuits for a grace period
//! - **Bindings**: [`HandleTable`] lets connections reference circuits without owning them

#![deny(unsafe_code)]

pub mod binding;
pub mod circuit;
pub mod error;
pub mod handler;
pub mod interop;
pub mod metrics;
pub mod registry;
pub mod render;
pub mod renderer;
pub mod session_id;
pub mod streams;

pub use binding::{HandleTable, Resolution};
pub use circuit::{
    Circuit, CircuitConfig, CircuitFault, CircuitOptions, CircuitState, ClientMessage, ClientProxy,
};
pub use error::{CircuitError, Result};
pub use handler::{CircuitHandler, CircuitHandlers};
pub use interop::{CallDirection, CallId, CallOutcome, PendingCallTable};
pub use registry::{CircuitRegistry, RegistryOptions};
pub use render::{AckOutcome, BatchId, RenderBatchFlowController};
pub use renderer::{
    Completion, ComponentMarker, DotNetInvocation, InteropContext, Renderer, RendererFactory,
    RootComponentOperation, StartRequest, parse_component_markers,
};
pub use session_id::{SessionId, SessionIdCodec};
pub use streams::{ChunkAck, StreamError, StreamId, StreamTransfers};
