//! Built-in output plugins

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::registry::ConfigurablePlugin;
use super::{OutputPlugin, PluginError, PluginOutcome};
use crate::flow::FlowResult;

fn default_emails_limit() -> u64 {
    100
}

/// Arguments for [`EmailOutputPlugin`]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EmailOutputPluginArgs {
    /// Recipient of the notifications
    #[serde(default)]
    pub email_address: String,

    /// Maximum number of emails sent over the flow's lifetime
    #[serde(default = "default_emails_limit")]
    pub emails_limit: u64,
}

impl Default for EmailOutputPluginArgs {
    fn default() -> Self {
        Self {
            email_address: String::new(),
            emails_limit: default_emails_limit(),
        }
    }
}

/// Notification sink: one email per result, up to `emails_limit`
///
/// Delivery is simulated; every message that would be sent is recorded as a
/// plugin log entry.
#[derive(Debug)]
pub struct EmailOutputPlugin {
    args: EmailOutputPluginArgs,
}

impl ConfigurablePlugin for EmailOutputPlugin {
    const NAME: &'static str = "EmailOutputPlugin";
    const DOC: &'static str = "Send an email notification for each result.";
    type Args = EmailOutputPluginArgs;

    fn from_args(args: Self::Args) -> Result<Self, PluginError> {
        if !args.email_address.contains('@') {
            return Err(PluginError::InvalidArgs(format!(
                "email_address must be an address, got {:?}",
                args.email_address
            )));
        }
        Ok(Self { args })
    }
}

#[async_trait]
impl OutputPlugin for EmailOutputPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process_results(
        &mut self,
        state: &mut Value,
        results: &[FlowResult],
    ) -> Result<PluginOutcome, PluginError> {
        let mut sent = state["emails_sent"].as_u64().unwrap_or(0);
        let mut outcome = PluginOutcome::default();

        for result in results {
            if sent >= self.args.emails_limit {
                outcome.logs.push(format!(
                    "emails_limit of {} reached, result {} not sent",
                    self.args.emails_limit, result.index
                ));
                continue;
            }
            outcome.logs.push(format!(
                "Sent email to {} for {} result {} of flow {}",
                self.args.email_address, result.payload_type, result.index, result.flow_id
            ));
            sent += 1;
            outcome.applied += 1;
        }

        *state = json!({ "emails_sent": sent });
        Ok(outcome)
    }
}

/// Arguments for [`JsonExportOutputPlugin`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct JsonExportOutputPluginArgs {
    /// Only export these payload types; empty exports everything
    #[serde(default)]
    pub payload_types: Vec<String>,
}

/// Export sink: appends one JSON line per result to the plugin state
#[derive(Debug)]
pub struct JsonExportOutputPlugin {
    args: JsonExportOutputPluginArgs,
}

impl ConfigurablePlugin for JsonExportOutputPlugin {
    const NAME: &'static str = "JsonExportOutputPlugin";
    const DOC: &'static str = "Export results as JSON lines.";
    type Args = JsonExportOutputPluginArgs;

    fn from_args(args: Self::Args) -> Result<Self, PluginError> {
        Ok(Self { args })
    }
}

#[async_trait]
impl OutputPlugin for JsonExportOutputPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process_results(
        &mut self,
        state: &mut Value,
        results: &[FlowResult],
    ) -> Result<PluginOutcome, PluginError> {
        let mut lines: Vec<Value> = state["lines"].as_array().cloned().unwrap_or_default();
        let mut applied = 0;

        for result in results {
            if !self.args.payload_types.is_empty()
                && !self.args.payload_types.contains(&result.payload_type)
            {
                continue;
            }
            let line = serde_json::to_string(result)
                .map_err(|e| PluginError::Sink(format!("cannot encode result: {e}")))?;
            lines.push(Value::String(line));
            applied += 1;
        }

        *state = json!({ "lines": lines });
        Ok(PluginOutcome::applied(applied).with_log(format!("Exported {applied} results")))
    }
}

/// Empty plugin arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NoArgs {}

/// Test sink that accepts everything
#[derive(Debug, Default)]
pub struct DummyOutputPlugin;

impl ConfigurablePlugin for DummyOutputPlugin {
    const NAME: &'static str = "DummyOutputPlugin";
    const DOC: &'static str = "Accept all results and do nothing.";
    type Args = NoArgs;

    fn from_args(_args: Self::Args) -> Result<Self, PluginError> {
        Ok(Self)
    }
}

#[async_trait]
impl OutputPlugin for DummyOutputPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process_results(
        &mut self,
        _state: &mut Value,
        results: &[FlowResult],
    ) -> Result<PluginOutcome, PluginError> {
        Ok(PluginOutcome::applied(results.len() as u64)
            .with_log(format!("Processed {} results", results.len())))
    }
}

/// Test sink that fails every batch
#[derive(Debug, Default)]
pub struct FailingDummyOutputPlugin;

impl ConfigurablePlugin for FailingDummyOutputPlugin {
    const NAME: &'static str = "FailingDummyOutputPlugin";
    const DOC: &'static str = "Fail on every batch.";
    type Args = NoArgs;

    fn from_args(_args: Self::Args) -> Result<Self, PluginError> {
        Ok(Self)
    }
}

#[async_trait]
impl OutputPlugin for FailingDummyOutputPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process_results(
        &mut self,
        _state: &mut Value,
        _results: &[FlowResult],
    ) -> Result<PluginOutcome, PluginError> {
        Err(PluginError::Sink("Oh no!".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ClientId, FlowId};
    use chrono::Utc;

    fn results(n: u64) -> Vec<FlowResult> {
        (0..n)
            .map(|index| FlowResult {
                client_id: ClientId::from_index(0),
                flow_id: FlowId::new("ABCDEF12").unwrap(),
                request_id: 1,
                index,
                payload_type: "Process".to_string(),
                payload: json!({"pid": index}),
                timestamp: Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_email_respects_limit_across_batches() {
        let mut plugin = EmailOutputPlugin::from_args(EmailOutputPluginArgs {
            email_address: "test@localhost".to_string(),
            emails_limit: 3,
        })
        .unwrap();
        let mut state = Value::Null;

        let first = plugin.process_results(&mut state, &results(2)).await.unwrap();
        assert_eq!(first.applied, 2);

        let second = plugin.process_results(&mut state, &results(2)).await.unwrap();
        assert_eq!(second.applied, 1);
        assert!(second.logs[1].contains("emails_limit of 3 reached"));
        assert_eq!(state["emails_sent"], 3);
    }

    #[test]
    fn test_email_requires_address() {
        let err = EmailOutputPlugin::from_args(EmailOutputPluginArgs::default()).unwrap_err();
        assert!(matches!(err, PluginError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_json_export_filters_types() {
        let mut plugin = JsonExportOutputPlugin::from_args(JsonExportOutputPluginArgs {
            payload_types: vec!["StatEntry".to_string()],
        })
        .unwrap();
        let mut state = Value::Null;

        let outcome = plugin.process_results(&mut state, &results(3)).await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(state["lines"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_json_export_appends_lines() {
        let mut plugin = JsonExportOutputPlugin::from_args(Default::default()).unwrap();
        let mut state = Value::Null;

        plugin.process_results(&mut state, &results(2)).await.unwrap();
        plugin.process_results(&mut state, &results(1)).await.unwrap();

        let lines = state["lines"].as_array().unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].as_str().unwrap().contains("\"payload_type\":\"Process\""));
    }

    #[tokio::test]
    async fn test_failing_dummy_always_fails() {
        let mut plugin = FailingDummyOutputPlugin;
        let mut state = Value::Null;
        assert!(plugin.process_results(&mut state, &results(1)).await.is_err());
    }
}
