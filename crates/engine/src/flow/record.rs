//! Persisted flow records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClientId, ClientResponse, FlowId, FlowKey, RequestId};
use crate::output::OutputPluginDescriptor;

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Flow is running (possibly waiting on client responses)
    Running,

    /// Termination was requested; outstanding work is being abandoned
    TerminatedPending,

    /// Flow finished, either naturally or after termination
    Terminated,

    /// Flow failed with a processing error
    Error,
}

impl FlowStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Whether moving from `self` to `next` is allowed
    ///
    /// Running may finish (Terminated), start termination
    /// (TerminatedPending) or fail (Error). TerminatedPending may only
    /// finish. Terminal states never change.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Terminated)
                | (Self::Running, Self::TerminatedPending)
                | (Self::Running, Self::Error)
                | (Self::TerminatedPending, Self::Terminated)
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::TerminatedPending => write!(f, "terminated_pending"),
            Self::Terminated => write!(f, "terminated"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Error for a disallowed status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("flow {key}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub key: FlowKey,
    pub from: FlowStatus,
    pub to: FlowStatus,
}

/// Runner configuration supplied at flow creation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerArgs {
    /// Output plugins applied to the flow's results, in declaration order
    #[serde(default)]
    pub output_plugins: Vec<OutputPluginDescriptor>,

    /// Notify the creator when the flow reaches a terminal state
    #[serde(default)]
    pub notify_to_user: bool,
}

impl RunnerArgs {
    pub fn with_output_plugin(mut self, descriptor: OutputPluginDescriptor) -> Self {
        self.output_plugins.push(descriptor);
        self
    }

    pub fn with_notification(mut self) -> Self {
        self.notify_to_user = true;
        self
    }
}

/// Link from a child flow to the parent request it answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub flow_id: FlowId,
    pub request_id: RequestId,
}

/// Flow record owned by the store and mutated only by the runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub flow_type: String,
    pub args: serde_json::Value,
    pub runner_args: RunnerArgs,

    /// Username of the principal that created the flow
    pub creator: String,

    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,

    /// Set for child flows
    pub parent: Option<ParentLink>,
    pub child_flow_ids: Vec<FlowId>,

    /// Reason given when termination was requested
    pub pending_termination: Option<String>,

    /// Set when the flow is in `Error`
    pub error_message: Option<String>,

    /// Serialized continuation state of the flow
    pub state: serde_json::Value,

    /// Next request id to allocate
    pub next_request_id: RequestId,

    /// Number of results written
    pub result_count: u64,

    /// Output plugin instance ids, parallel to `runner_args.output_plugins`
    pub output_plugin_ids: Vec<String>,

    /// Optimistic concurrency version, bumped by the store on every update
    pub version: u64,
}

impl FlowRecord {
    /// Create a fresh running record
    pub fn new(
        key: FlowKey,
        flow_type: impl Into<String>,
        args: serde_json::Value,
        runner_args: RunnerArgs,
        creator: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            flow_type: flow_type.into(),
            args,
            runner_args,
            creator: creator.into(),
            status: FlowStatus::Running,
            created_at: now,
            last_update_at: now,
            parent: None,
            child_flow_ids: vec![],
            pending_termination: None,
            error_message: None,
            state: serde_json::Value::Null,
            next_request_id: 1,
            result_count: 0,
            output_plugin_ids: vec![],
            version: 0,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.key.client_id
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.key.flow_id
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Apply a status change, enforcing monotonic transitions
    pub fn transition(&mut self, next: FlowStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                key: self.key.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.last_update_at = Utc::now();
        Ok(())
    }

    /// Allocate the next request id
    pub fn allocate_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting for a response
    Pending,

    /// Response received (possibly a synthesized failure)
    Answered,

    /// No response arrived before the deadline
    TimedOut,

    /// Flow was terminated while the request was outstanding
    Abandoned,
}

impl RequestState {
    pub fn is_outstanding(self) -> bool {
        self == Self::Pending
    }
}

/// What a request is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestTarget {
    /// A client action executed by the agent
    ClientAction { action: String },

    /// A child flow
    ChildFlow { flow_name: String, flow_id: FlowId },
}

/// A unit of work issued by a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    pub request_id: RequestId,
    pub target: RequestTarget,
    pub payload: serde_json::Value,
    pub next_state: String,
    pub state: RequestState,

    /// Delivery attempts made by the dispatcher
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub response: Option<ClientResponse>,
}

impl FlowRequest {
    pub fn new(
        request_id: RequestId,
        target: RequestTarget,
        payload: serde_json::Value,
        next_state: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            target,
            payload,
            next_state: next_state.into(),
            state: RequestState::Pending,
            attempts: 0,
            created_at: Utc::now(),
            response: None,
        }
    }
}

/// A typed result produced by a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub client_id: ClientId,
    pub flow_id: FlowId,

    /// Request whose response produced this result (0 when produced at start)
    pub request_id: RequestId,

    /// Dense, 0-based index within the flow
    pub index: u64,
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FlowResult {
    /// Textual representation used for substring filtering
    ///
    /// Only the payload; filter on the type with its own field.
    pub fn search_text(&self) -> String {
        self.payload.to_string()
    }
}

/// Flow log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowLogEntry {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub timestamp: DateTime<Utc>,

    /// Insertion sequence, assigned by the store
    pub sequence: u64,
    pub message: String,
}

impl FlowLogEntry {
    pub fn new(key: &FlowKey, message: impl Into<String>) -> Self {
        Self {
            client_id: key.client_id.clone(),
            flow_id: key.flow_id.clone(),
            timestamp: Utc::now(),
            sequence: 0,
            message: message.into(),
        }
    }

    /// Override the timestamp (fixtures, imported logs)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A known client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub first_seen_at: DateTime<Utc>,
}

impl ClientRecord {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            first_seen_at: Utc::now(),
        }
    }
}

/// Notification for the user who created a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotification {
    pub id: uuid::Uuid,
    pub username: String,
    pub flow: FlowKey,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> FlowRecord {
        FlowRecord::new(
            FlowKey::new(ClientId::from_index(0), FlowId::new("ABCDEF12").unwrap()),
            "ListProcesses",
            json!({}),
            RunnerArgs::default(),
            "test",
        )
    }

    #[test]
    fn test_new_record_is_running() {
        let record = record();
        assert_eq!(record.status, FlowStatus::Running);
        assert_eq!(record.next_request_id, 1);
        assert!(!record.is_child());
    }

    #[test]
    fn test_termination_path() {
        let mut record = record();
        record.transition(FlowStatus::TerminatedPending).unwrap();
        record.transition(FlowStatus::Terminated).unwrap();
        assert!(record.status.is_terminal());
    }

    #[test]
    fn test_no_resurrection() {
        let mut record = record();
        record.transition(FlowStatus::Terminated).unwrap();

        for next in [
            FlowStatus::Running,
            FlowStatus::TerminatedPending,
            FlowStatus::Error,
            FlowStatus::Terminated,
        ] {
            let err = record.transition(next).unwrap_err();
            assert_eq!(err.from, FlowStatus::Terminated);
        }
    }

    #[test]
    fn test_error_is_terminal() {
        let mut record = record();
        record.transition(FlowStatus::Error).unwrap();
        assert!(record.transition(FlowStatus::Terminated).is_err());
    }

    #[test]
    fn test_pending_termination_cannot_fail() {
        assert!(!FlowStatus::TerminatedPending.can_transition_to(FlowStatus::Error));
        assert!(!FlowStatus::TerminatedPending.can_transition_to(FlowStatus::Running));
    }

    #[test]
    fn test_allocate_request_ids() {
        let mut record = record();
        assert_eq!(record.allocate_request_id(), 1);
        assert_eq!(record.allocate_request_id(), 2);
        assert_eq!(record.next_request_id, 3);
    }

    #[test]
    fn test_result_search_text_is_payload_only() {
        let result = FlowResult {
            client_id: ClientId::from_index(0),
            flow_id: FlowId::new("ABCDEF12").unwrap(),
            request_id: 1,
            index: 0,
            payload_type: "Process".to_string(),
            payload: json!({"name": "test_process"}),
            timestamp: Utc::now(),
        };
        let text = result.search_text();
        assert!(!text.contains("Process"));
        assert!(text.contains("test_process"));
    }
}
