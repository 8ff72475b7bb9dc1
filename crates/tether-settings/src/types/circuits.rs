//! Circuit lifecycle settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection grace period, backpressure and interop limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitSettings {
    /// Maximum number of disconnected circuits kept for reconnection.
    pub disconnected_circuit_max_retained: usize,
    /// How long a disconnected circuit stays resumable, in milliseconds.
    pub disconnected_circuit_retention_ms: u64,
    /// Render batches that may be in flight without an acknowledgement.
    pub max_buffered_unacknowledged_render_batches: usize,
    /// Default timeout for interop calls and stream heartbeats, in milliseconds.
    pub js_interop_default_call_timeout_ms: u64,
    /// Root components that may be added after the circuit started.
    pub max_root_components: usize,
    /// Send full error details to the client on circuit failure.
    pub detailed_errors: bool,
    /// Period of the background eviction sweep, in milliseconds.
    pub eviction_sweep_interval_ms: u64,
    /// Chunk size used when streaming data to the client.
    pub stream_chunk_size: usize,
    /// Largest inbound stream a client may announce, in bytes.
    pub max_inbound_stream_length: u64,
    /// Capacity of each circuit's command inbox.
    pub inbox_capacity: usize,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            disconnected_circuit_max_retained: 100,
            disconnected_circuit_retention_ms: 180_000,
            max_buffered_unacknowledged_render_batches: 10,
            js_interop_default_call_timeout_ms: 60_000,
            max_root_components: 100,
            detailed_errors: false,
            eviction_sweep_interval_ms: 5_000,
            stream_chunk_size: 32 * 1024,
            max_inbound_stream_length: 50 * 1024 * 1024,
            inbox_capacity: 256,
        }
    }
}

impl CircuitSettings {
    /// Grace period for disconnected circuits.
    pub fn retention_period(&self) -> Duration {
        Duration::from_millis(self.disconnected_circuit_retention_ms)
    }

    /// Default interop call timeout.
    pub fn interop_timeout(&self) -> Duration {
        Duration::from_millis(self.js_interop_default_call_timeout_ms)
    }

    /// Background eviction sweep period.
    pub fn eviction_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let c = CircuitSettings::default();
        assert_eq!(c.disconnected_circuit_max_retained, 100);
        assert_eq!(c.retention_period(), Duration::from_secs(180));
        assert_eq!(c.max_buffered_unacknowledged_render_batches, 10);
        assert_eq!(c.interop_timeout(), Duration::from_secs(60));
        assert_eq!(c.max_root_components, 100);
        assert!(!c.detailed_errors);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c: CircuitSettings =
            serde_json::from_str(r#"{"disconnectedCircuitMaxRetained": 3}"#).unwrap();
        assert_eq!(c.disconnected_circuit_max_retained, 3);
        assert_eq!(c.max_root_components, 100);
    }
}
