//! Structured logging with `tracing` and verbosity-gated secret redaction.
//!
//! Log context (circuit ID, connection ID) travels as span and event fields.
//! Anything that authenticates a client, such as a session secret, is only
//! ever formatted through [`RedactionPolicy::secret`], which prints a
//! placeholder unless detailed diagnostics were switched on explicitly.

use std::fmt;

use tether_settings::LoggingSettings;

/// Placeholder printed in place of a redacted value.
pub const REDACTED: &str = "[redacted]";

/// Initialize the global tracing subscriber with compact stderr output.
///
/// Call once at application startup. Subsequent calls are no-ops.
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init is a no-op if a global default is already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON-lines stderr output.
pub fn init_json_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json();

    let _ = subscriber.try_init();
}

/// Install the subscriber `settings` asks for and return the matching
/// redaction policy.
pub fn init_from(settings: &LoggingSettings) -> RedactionPolicy {
    if settings.json {
        init_json_subscriber(&settings.level);
    } else {
        init_subscriber(&settings.level);
    }
    RedactionPolicy::from(settings)
}

/// Decides whether sensitive values may appear in log output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedactionPolicy {
    detailed: bool,
}

impl RedactionPolicy {
    /// Policy that redacts every secret (the default).
    pub const fn redacting() -> Self {
        Self { detailed: false }
    }

    /// Policy that prints secrets verbatim. Only for explicit diagnostics.
    pub const fn detailed() -> Self {
        Self { detailed: true }
    }

    /// Build from the `detailedDiagnostics` setting.
    pub const fn from_detailed(detailed: bool) -> Self {
        Self { detailed }
    }

    /// Whether secrets are printed verbatim.
    pub fn is_detailed(self) -> bool {
        self.detailed
    }

    /// Wrap a secret for logging.
    pub fn secret(self, value: &str) -> Redacted<'_> {
        Redacted {
            value,
            show: self.detailed,
        }
    }
}

impl From<&LoggingSettings> for RedactionPolicy {
    fn from(settings: &LoggingSettings) -> Self {
        Self::from_detailed(settings.detailed_diagnostics)
    }
}

/// A value that formats as [`REDACTED`] unless its policy allows otherwise.
#[derive(Clone, Copy)]
pub struct Redacted<'a> {
    value: &'a str,
    show: bool,
}

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.show {
            f.write_str(self.value)
        } else {
            f.write_str(REDACTED)
        }
    }
}

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_redacts() {
        let policy = RedactionPolicy::default();
        assert!(!policy.is_detailed());
        assert_eq!(policy.secret("s3cr3t").to_string(), REDACTED);
        assert_eq!(format!("{:?}", policy.secret("s3cr3t")), REDACTED);
    }

    #[test]
    fn detailed_policy_prints_value() {
        let policy = RedactionPolicy::detailed();
        assert_eq!(policy.secret("s3cr3t").to_string(), "s3cr3t");
    }

    #[test]
    fn from_setting() {
        assert_eq!(RedactionPolicy::from_detailed(false), RedactionPolicy::redacting());
        assert_eq!(RedactionPolicy::from_detailed(true), RedactionPolicy::detailed());
    }

    #[test]
    fn policy_follows_logging_settings() {
        let mut settings = LoggingSettings::default();
        assert_eq!(RedactionPolicy::from(&settings), RedactionPolicy::redacting());
        settings.detailed_diagnostics = true;
        settings.json = true;
        assert!(init_from(&settings).is_detailed());
    }

    #[test]
    fn init_subscriber_does_not_panic() {
        // Multiple calls should be safe (no-op after first)
        init_subscriber("warn");
        init_subscriber("debug");
        init_json_subscriber("info");
    }
}
