//! Flow actions and client responses

use serde::{Deserialize, Serialize};

/// Actions a flow can request
///
/// These are the commands a flow issues from its state handlers. The runner
/// persists their effects (requests, results, log entries) before the next
/// state handler runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    /// Send a request to the flow's client
    CallClient {
        /// Client action to invoke on the agent (e.g. `ListProcesses`)
        action: String,

        /// Request payload (JSON)
        payload: serde_json::Value,

        /// State handler that receives the response
        next_state: String,
    },

    /// Start a child flow on the same client
    ///
    /// The child's replies are delivered to `next_state` once it finishes.
    CallFlow {
        /// Registered flow type name
        flow_name: String,

        /// Arguments for the child flow
        args: serde_json::Value,

        /// State handler that receives the child's replies
        next_state: String,
    },

    /// Emit a result
    SendReply {
        /// Payload type name (e.g. `Process`, `StatEntry`)
        payload_type: String,

        /// Result payload (JSON)
        payload: serde_json::Value,
    },

    /// Append a message to the flow log
    Log {
        message: String,
    },
}

impl FlowAction {
    /// Create a client call action
    pub fn call_client(
        action: impl Into<String>,
        payload: serde_json::Value,
        next_state: impl Into<String>,
    ) -> Self {
        Self::CallClient {
            action: action.into(),
            payload,
            next_state: next_state.into(),
        }
    }

    /// Create a child flow action
    pub fn call_flow(
        flow_name: impl Into<String>,
        args: serde_json::Value,
        next_state: impl Into<String>,
    ) -> Self {
        Self::CallFlow {
            flow_name: flow_name.into(),
            args,
            next_state: next_state.into(),
        }
    }

    /// Create a reply action
    pub fn reply(payload_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::SendReply {
            payload_type: payload_type.into(),
            payload,
        }
    }

    /// Create a log action
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    /// Whether this action creates outstanding work
    pub fn is_request(&self) -> bool {
        matches!(self, Self::CallClient { .. } | Self::CallFlow { .. })
    }
}

/// Outcome of a request as reported by the client (or synthesized)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error { message: String },
}

/// Response to a single request
///
/// A client answers a request with zero or more payloads followed by a
/// status. Delivery failures are reported the same way with an error status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientResponse {
    pub status: ResponseStatus,

    #[serde(default)]
    pub payloads: Vec<serde_json::Value>,
}

impl ClientResponse {
    /// Successful response carrying payloads
    pub fn ok(payloads: Vec<serde_json::Value>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            payloads,
        }
    }

    /// Failed response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error {
                message: message.into(),
            },
            payloads: vec![],
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ResponseStatus::Ok)
    }

    /// Error message, if the response is a failure
    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            ResponseStatus::Ok => None,
            ResponseStatus::Error { message } => Some(message),
        }
    }
}
