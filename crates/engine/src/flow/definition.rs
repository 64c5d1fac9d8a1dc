//! Flow trait definition

use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{ClientResponse, FlowAction};

/// Fatal error raised by a flow's state handler
///
/// Returning this from a handler moves the flow to `Error`; it is recorded
/// in the flow log and never retried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl FlowError {
    /// Create a new flow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Error for a response routed to a state the flow does not know
    pub fn unknown_state(flow: &str, state: &str) -> Self {
        Self::new(format!("{flow} has no state named {state:?}")).with_code("UNKNOWN_STATE")
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FlowError {}

/// A flow is a state machine driven by client responses
///
/// Flows define:
/// - How to start (`on_start`)
/// - How to handle the response to each request (`on_response`), routed by
///   the `next_state` name given when the request was issued
/// - What to do once no requests are outstanding (`on_complete`)
///
/// The flow value itself is the continuation state: it is serialized after
/// every transition and restored before the next one, so anything a later
/// state needs must live in a field.
///
/// # Example
///
/// ```ignore
/// use fleetflow_engine::prelude::*;
///
/// #[derive(Serialize, Deserialize)]
/// struct ListUsers { args: ListUsersArgs }
///
/// impl Flow for ListUsers {
///     const NAME: &'static str = "ListUsers";
///     const CATEGORY: &'static str = "Collectors";
///     type Args = ListUsersArgs;
///
///     fn new(args: Self::Args) -> Self { Self { args } }
///
///     fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
///         Ok(vec![FlowAction::call_client("EnumerateUsers", json!({}), "Done")])
///     }
///
///     fn on_response(&mut self, state: &str, response: ClientResponse)
///         -> Result<Vec<FlowAction>, FlowError> {
///         // ...
///     }
/// }
/// ```
pub trait Flow: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique type name, used for lookup in the registry
    const NAME: &'static str;

    /// Category shown in flow descriptors
    const CATEGORY: &'static str;

    /// One-line description shown in flow descriptors
    const DOC: &'static str = "";

    /// Arguments accepted by the flow
    type Args: Serialize + DeserializeOwned + JsonSchema + Default + Clone + Send;

    /// Validate arguments beyond what deserialization checks
    fn validate_args(args: &Self::Args) -> Result<(), String> {
        let _ = args;
        Ok(())
    }

    /// Create a new flow instance from validated arguments
    fn new(args: Self::Args) -> Self;

    /// Called once when the flow starts
    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError>;

    /// Called with the response to a request issued earlier
    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError>;

    /// Called when no requests or child flows are outstanding
    ///
    /// Returning further requests keeps the flow running.
    fn on_complete(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(vec![])
    }
}

/// Metadata describing an available flow type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDescriptor {
    pub name: String,
    pub category: String,
    pub doc: String,

    /// JSON schema of the flow's arguments
    pub args_schema: serde_json::Value,

    /// Arguments used when none are supplied
    pub default_args: serde_json::Value,
}
