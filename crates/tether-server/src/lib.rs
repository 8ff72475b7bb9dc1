//! # tether-server
//!
//! Axum HTTP + `WebSocket` endpoint for circuits.
//!
//! - `WebSocket` gateway at `/_tether`: JSON RPC dispatch, heartbeat, circuit push events
//! - Method handlers for starting, reconnecting and driving circuits
//! - Disconnect and page-visibility beacons
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod beacon;
pub mod health;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use rpc::handlers::register_all;
pub use rpc::registry::MethodRegistry;
pub use server::TetherServer;
