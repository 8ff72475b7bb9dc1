//! Metric names recorded by circuits and the registry.

/// Circuits bound to a live connection (gauge).
pub const CIRCUITS_ACTIVE: &str = "circuits_active";
/// Circuits waiting in the reconnection pool (gauge).
pub const CIRCUITS_DISCONNECTED: &str = "circuits_disconnected";
/// Circuits evicted from the reconnection pool (counter, labels: reason).
pub const CIRCUIT_EVICTIONS_TOTAL: &str = "circuit_evictions_total";
/// Circuits terminated by an application fault (counter).
pub const CIRCUIT_FAULTS_TOTAL: &str = "circuit_faults_total";
/// Reconnect attempts (counter, labels: outcome).
pub const CIRCUIT_RECONNECTS_TOTAL: &str = "circuit_reconnects_total";
