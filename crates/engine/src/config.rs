//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatcherConfig;
use crate::engine::RunnerConfig;
use crate::reliability::RetryPolicy;

/// Default prefix of the generated results export command
pub const DEFAULT_EXPORT_COMMAND_PREFIX: &str =
    "/usr/bin/fleetflow_api_shell 'http://localhost:8000'";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds a value that does not parse
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub runner: RunnerConfig,

    /// Prefix of the command returned by `get_flow_results_export_command`
    pub export_command_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            runner: RunnerConfig::default(),
            export_command_prefix: DEFAULT_EXPORT_COMMAND_PREFIX.to_string(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FLEETFLOW_RETRY_MAX_ATTEMPTS`: delivery attempts per request (default: 5)
    /// - `FLEETFLOW_RETRY_INITIAL_MS`: first retry delay (default: 500)
    /// - `FLEETFLOW_RETRY_MAX_MS`: retry delay cap (default: 30000)
    /// - `FLEETFLOW_RESPONSE_TIMEOUT_MS`: response deadline (default: none)
    /// - `FLEETFLOW_PROCESSING_BUDGET_MS`: per-transition budget (default: 30000)
    /// - `FLEETFLOW_MAX_RESULTS_PER_BATCH`: output plugin batch size (default: 100)
    /// - `FLEETFLOW_EXPORT_COMMAND_PREFIX`: export command prefix
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let millis = |var: &str| -> Result<Option<Duration>, ConfigError> {
            parse::<u64>(&lookup, var).map(|v| v.map(Duration::from_millis))
        };

        let mut config = Self::default();
        let mut retry = config.dispatcher.retry.clone();

        if let Some(attempts) = parse::<u32>(&lookup, "FLEETFLOW_RETRY_MAX_ATTEMPTS")? {
            retry = retry.with_max_attempts(attempts);
        }
        if let Some(initial) = millis("FLEETFLOW_RETRY_INITIAL_MS")? {
            retry = retry.with_base_delay(initial);
        }
        if let Some(max) = millis("FLEETFLOW_RETRY_MAX_MS")? {
            retry = retry.with_max_delay(max);
        }
        config.dispatcher.retry = retry;

        if let Some(timeout) = millis("FLEETFLOW_RESPONSE_TIMEOUT_MS")? {
            config.dispatcher.response_timeout = Some(timeout);
        }
        if let Some(budget) = millis("FLEETFLOW_PROCESSING_BUDGET_MS")? {
            config.runner.processing_budget = budget;
        }
        if let Some(max) = parse::<usize>(&lookup, "FLEETFLOW_MAX_RESULTS_PER_BATCH")? {
            config.runner = config.runner.with_max_results_per_batch(max);
        }
        if let Some(prefix) = lookup("FLEETFLOW_EXPORT_COMMAND_PREFIX") {
            config.export_command_prefix = prefix;
        }

        Ok(config)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.dispatcher.retry = retry;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher.response_timeout = Some(timeout);
        self
    }

    pub fn with_processing_budget(mut self, budget: Duration) -> Self {
        self.runner.processing_budget = budget;
        self
    }

    pub fn with_export_command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.export_command_prefix = prefix.into();
        self
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
    }
}
