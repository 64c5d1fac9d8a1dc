//! Client transport abstraction

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::flow::{ClientId, FlowId, RequestId};

/// Errors from delivering a message to a client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Client is not connected; delivery may succeed later
    #[error("client {0} is unreachable")]
    Unreachable(ClientId),

    /// Client refused the message; retrying will not help
    #[error("client {client_id} rejected the request: {reason}")]
    Rejected { client_id: ClientId, reason: String },
}

impl TransportError {
    /// Whether redelivery may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// A request on its way to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: RequestId,

    /// Client action name, e.g. `ListProcesses`
    pub action: String,
    pub payload: serde_json::Value,
}

/// Outbound channel to clients
///
/// Responses travel back through
/// [`ClientActionDispatcher::on_response`](super::ClientActionDispatcher::on_response).
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Hand a message to the client
    async fn deliver(&self, message: ClientMessage) -> Result<(), TransportError>;
}

/// In-process transport: each connected client gets an inbox channel
///
/// # Example
///
/// ```
/// use fleetflow_engine::{ChannelTransport, ClientId};
///
/// let transport = ChannelTransport::new();
/// let inbox = transport.connect(ClientId::from_index(0));
/// assert!(transport.is_connected(&ClientId::from_index(0)));
/// # drop(inbox);
/// ```
#[derive(Debug, Default)]
pub struct ChannelTransport {
    inboxes: DashMap<ClientId, mpsc::UnboundedSender<ClientMessage>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client, replacing any previous inbox
    pub fn connect(&self, client_id: ClientId) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(client_id, tx);
        rx
    }

    pub fn disconnect(&self, client_id: &ClientId) {
        self.inboxes.remove(client_id);
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.inboxes
            .get(client_id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn deliver(&self, message: ClientMessage) -> Result<(), TransportError> {
        let client_id = message.client_id.clone();
        let sender = self
            .inboxes
            .get(&client_id)
            .map(|tx| tx.clone())
            .ok_or_else(|| TransportError::Unreachable(client_id.clone()))?;

        sender
            .send(message)
            .map_err(|_| TransportError::Unreachable(client_id))
    }
}
