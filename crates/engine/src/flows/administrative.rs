//! Client interrogation

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::ADMINISTRATIVE;
use crate::flow::{ClientResponse, Flow, FlowAction, FlowError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct InterrogateArgs {
    /// Skip the slower collection steps (network interfaces)
    #[serde(default)]
    pub lightweight: bool,
}

/// Collects basic facts about a client into a single summary
#[derive(Debug, Serialize, Deserialize)]
pub struct Interrogate {
    args: InterrogateArgs,
    #[serde(default)]
    summary: Map<String, Value>,
}

impl Flow for Interrogate {
    const NAME: &'static str = "Interrogate";
    const CATEGORY: &'static str = ADMINISTRATIVE;
    const DOC: &'static str = "Interrogate the client for basic system information.";
    type Args = InterrogateArgs;

    fn new(args: Self::Args) -> Self {
        Self {
            args,
            summary: Map::new(),
        }
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        let mut actions = vec![
            FlowAction::call_client("GetPlatformInfo", json!({}), "Platform"),
            FlowAction::call_client("GetClientInfo", json!({}), "ClientInfo"),
        ];
        if !self.args.lightweight {
            actions.push(FlowAction::call_client(
                "EnumerateInterfaces",
                json!({}),
                "Interfaces",
            ));
        }
        Ok(actions)
    }

    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        let field = match state {
            "Platform" => "platform",
            "ClientInfo" => "client_info",
            "Interfaces" => "interfaces",
            other => return Err(FlowError::unknown_state(Self::NAME, other)),
        };

        if let Some(message) = response.error_message() {
            return Ok(vec![FlowAction::log(format!("{state} failed: {message}"))]);
        }

        let value = if field == "interfaces" {
            Value::Array(response.payloads)
        } else {
            response.payloads.into_iter().next().unwrap_or(Value::Null)
        };
        self.summary.insert(field.to_string(), value);
        Ok(vec![])
    }

    fn on_complete(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(vec![
            FlowAction::reply("ClientSummary", Value::Object(self.summary.clone())),
            FlowAction::log("Interrogation complete"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lightweight_skips_interfaces() {
        let mut full = Interrogate::new(InterrogateArgs::default());
        assert_eq!(full.on_start().unwrap().len(), 3);

        let mut light = Interrogate::new(InterrogateArgs { lightweight: true });
        assert_eq!(light.on_start().unwrap().len(), 2);
    }

    #[test]
    fn test_summary_collects_responses() {
        let mut flow = Interrogate::new(InterrogateArgs::default());
        flow.on_response(
            "Platform",
            ClientResponse::ok(vec![json!({"system": "Linux"})]),
        )
        .unwrap();
        flow.on_response(
            "Interfaces",
            ClientResponse::ok(vec![json!({"ifname": "lo"}), json!({"ifname": "eth0"})]),
        )
        .unwrap();
        let actions = flow
            .on_response("ClientInfo", ClientResponse::error("timeout"))
            .unwrap();
        assert_eq!(actions, vec![FlowAction::log("ClientInfo failed: timeout")]);

        let actions = flow.on_complete().unwrap();
        match &actions[0] {
            FlowAction::SendReply {
                payload_type,
                payload,
            } => {
                assert_eq!(payload_type, "ClientSummary");
                assert_eq!(payload["platform"]["system"], "Linux");
                assert_eq!(payload["interfaces"].as_array().unwrap().len(), 2);
                assert!(payload.get("client_info").is_none());
            }
            other => panic!("Expected SendReply, got {other:?}"),
        }
    }
}
