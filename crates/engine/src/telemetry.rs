// Tracing setup
//
// Installs a tracing-subscriber fmt layer filtered by RUST_LOG / LOG_LEVEL.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "fleetflow_engine=info,fleetflow=info";

/// Configuration for log output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// Log filter (e.g., "info", "fleetflow_engine=debug")
    pub log_filter: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "fleetflow".to_string(),
            log_filter: None,
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FLEETFLOW_SERVICE_NAME`: Service name (default: "fleetflow")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `FLEETFLOW_LOG_FORMAT`: "json" for JSON output
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("FLEETFLOW_SERVICE_NAME")
                .unwrap_or_else(|_| "fleetflow".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            json: std::env::var("FLEETFLOW_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            with_target: true,
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global tracing subscriber
///
/// Returns an error if a subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use fleetflow_engine::telemetry::{init_tracing, TelemetryConfig};
///
/// init_tracing(TelemetryConfig::from_env())?;
/// ```
pub fn init_tracing(
    config: TelemetryConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = config.env_filter();

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).try_init()?;

    tracing::debug!(service = %config.service_name, json = config.json, "tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "fleetflow");
        assert!(config.log_filter.is_none());
        assert!(!config.json);
    }

    #[test]
    fn test_builders() {
        let config = TelemetryConfig::default()
            .with_log_filter("fleetflow_engine=debug")
            .with_json(true);
        assert_eq!(config.log_filter.as_deref(), Some("fleetflow_engine=debug"));
        assert!(config.json);
    }
}
