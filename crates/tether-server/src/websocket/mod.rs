//! WebSocket connection management, heartbeat, message dispatch, and
//! circuit push events.

pub mod connection;
pub mod events;
pub mod handler;
pub mod heartbeat;
pub mod session;
