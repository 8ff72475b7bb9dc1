//! Server transport and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Interval between server Ping frames in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Drop a connection that has been silent this long (milliseconds).
    pub heartbeat_timeout_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound message queue.
    pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 30_000,
            max_message_size: 32 * 1024,
            outbound_queue_capacity: 1024,
        }
    }
}

impl ServerSettings {
    /// Heartbeat ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence tolerated before a connection is dropped.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Print session secrets and raw tokens in diagnostics.
    pub detailed_diagnostics: bool,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            detailed_diagnostics: false,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 5000);
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(s.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(s.max_message_size, 32 * 1024);
    }

    #[test]
    fn partial_server_json() {
        let s: ServerSettings = serde_json::from_str(r#"{"port": 0}"#).unwrap();
        assert_eq!(s.port, 0);
        assert_eq!(s.host, "127.0.0.1");
    }

    #[test]
    fn logging_defaults_redact() {
        let l = LoggingSettings::default();
        assert_eq!(l.level, "info");
        assert!(!l.detailed_diagnostics);
        assert!(!l.json);
    }
}
