//! Output plugin trait and state types

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::{ClientId, FlowId, FlowKey, FlowResult};

/// Output plugin requested for a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputPluginDescriptor {
    /// Registered plugin name, e.g. `EmailOutputPlugin`
    pub plugin_name: String,

    /// Plugin-specific arguments
    #[serde(default)]
    pub plugin_args: serde_json::Value,
}

impl OutputPluginDescriptor {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            plugin_args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, plugin_args: serde_json::Value) -> Self {
        self.plugin_args = plugin_args;
        self
    }
}

/// Instance ids for `descriptors`, in declaration order
///
/// Each id is `<PluginName>_<ordinal>` where the ordinal counts earlier
/// instances of the same plugin name on the flow.
pub fn plugin_instance_ids(descriptors: &[OutputPluginDescriptor]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    descriptors
        .iter()
        .map(|d| {
            let ordinal = seen.entry(d.plugin_name.as_str()).or_insert(0);
            let id = format!("{}_{}", d.plugin_name, ordinal);
            *ordinal += 1;
            id
        })
        .collect()
}

/// Error raised by a plugin while processing a batch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// Plugin arguments are missing or malformed
    #[error("invalid plugin arguments: {0}")]
    InvalidArgs(String),

    /// Sink rejected or failed to accept the batch
    #[error("{0}")]
    Sink(String),

    /// Plugin panicked while processing
    #[error("plugin panicked: {0}")]
    Panicked(String),
}

/// What a plugin did with a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginOutcome {
    /// Number of results the plugin applied
    pub applied: u64,
    pub logs: Vec<String>,

    /// Non-fatal, per-result problems reported by the plugin
    pub errors: Vec<String>,
}

impl PluginOutcome {
    pub fn applied(applied: u64) -> Self {
        Self {
            applied,
            ..Default::default()
        }
    }

    pub fn with_log(mut self, message: impl Into<String>) -> Self {
        self.logs.push(message.into());
        self
    }
}

/// A pluggable post-processor for flow results
///
/// Plugins are created per batch from their descriptor. Anything that must
/// survive between batches lives in `state`, which the pipeline persists.
#[async_trait]
pub trait OutputPlugin: Send {
    /// Registered plugin name
    fn name(&self) -> &'static str;

    /// Process a batch of results
    async fn process_results(
        &mut self,
        state: &mut serde_json::Value,
        results: &[FlowResult],
    ) -> Result<PluginOutcome, PluginError>;
}

/// Per-flow, per-instance plugin record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPluginState {
    /// `<PluginName>_<ordinal>`
    pub plugin_id: String,
    pub descriptor: OutputPluginDescriptor,
    pub applied_count: u64,
    pub log_count: u64,
    pub error_count: u64,

    /// Plugin-owned state
    pub state: serde_json::Value,
}

impl OutputPluginState {
    pub fn new(plugin_id: impl Into<String>, descriptor: OutputPluginDescriptor) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            descriptor,
            applied_count: 0,
            log_count: 0,
            error_count: 0,
            state: serde_json::Value::Null,
        }
    }
}

/// A log or error entry written by a plugin instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPluginLogEntry {
    pub id: Uuid,
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub plugin_id: String,

    /// Index of the first result in the batch that produced the entry
    pub first_result_index: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputPluginLogEntry {
    pub fn new(
        key: &FlowKey,
        plugin_id: impl Into<String>,
        first_result_index: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            client_id: key.client_id.clone(),
            flow_id: key.flow_id.clone(),
            plugin_id: plugin_id.into(),
            first_result_index,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything a single batch changed for one plugin instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginBatchRecord {
    pub applied: u64,

    /// Replacement plugin state; `None` leaves it unchanged
    pub state: Option<serde_json::Value>,
    pub logs: Vec<OutputPluginLogEntry>,
    pub errors: Vec<OutputPluginLogEntry>,
}
