//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. `#[serde(default)]` allows partial
//! JSON: missing fields get their default during deserialization.

mod circuits;
mod server;

pub use circuits::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 8080 },
///   "circuits": { "disconnectedCircuitMaxRetained": 50 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Transport and HTTP settings.
    pub server: ServerSettings,
    /// Circuit lifecycle, reconnection and backpressure settings.
    pub circuits: CircuitSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.circuits;
        let checks: [(&str, bool); 6] = [
            (
                "circuits.maxBufferedUnacknowledgedRenderBatches",
                c.max_buffered_unacknowledged_render_batches > 0,
            ),
            ("circuits.inboxCapacity", c.inbox_capacity > 0),
            ("circuits.streamChunkSize", c.stream_chunk_size > 0),
            (
                "circuits.evictionSweepIntervalMs",
                c.eviction_sweep_interval_ms > 0,
            ),
            (
                "server.outboundQueueCapacity",
                self.server.outbound_queue_capacity > 0,
            ),
            (
                "server.heartbeatIntervalMs",
                self.server.heartbeat_interval_ms > 0,
            ),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(SettingsError::InvalidValue(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(TetherSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_window_rejected() {
        let mut settings = TetherSettings::default();
        settings.circuits.max_buffered_unacknowledged_render_batches = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("maxBufferedUnacknowledgedRenderBatches"));
    }

    #[test]
    fn serializes_camel_case_groups() {
        let json = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(json["server"]["heartbeatIntervalMs"].is_number());
        assert!(json["circuits"]["disconnectedCircuitRetentionMs"].is_number());
        assert!(json["logging"]["detailedDiagnostics"].is_boolean());
    }
}
