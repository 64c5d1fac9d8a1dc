//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetflow_engine::flows::{register_builtins, Process};
use fleetflow_engine::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CLIENT_ID: &str = "C.1000000000000000";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// Replies once from its start handler and finishes without client requests
#[derive(Debug, Serialize, Deserialize)]
pub struct DummyFlowWithSingleReply;

impl Flow for DummyFlowWithSingleReply {
    const NAME: &'static str = "DummyFlowWithSingleReply";
    const CATEGORY: &'static str = "Testing";
    type Args = NoArgs;

    fn new(_args: Self::Args) -> Self {
        Self
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(vec![FlowAction::reply("DummyReply", json!({"value": "single"}))])
    }

    fn on_response(
        &mut self,
        state: &str,
        _response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        Err(FlowError::unknown_state(Self::NAME, state))
    }
}

/// Writes two log entries and finishes
#[derive(Debug, Serialize, Deserialize)]
pub struct DummyLogFlow;

impl Flow for DummyLogFlow {
    const NAME: &'static str = "DummyLogFlow";
    const CATEGORY: &'static str = "Testing";
    type Args = NoArgs;

    fn new(_args: Self::Args) -> Self {
        Self
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(vec![FlowAction::log("First"), FlowAction::log("Second")])
    }

    fn on_response(
        &mut self,
        state: &str,
        _response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        Err(FlowError::unknown_state(Self::NAME, state))
    }
}

/// Engine wired to an in-memory store and a channel transport
pub struct TestEngine {
    pub lifecycle: FlowLifecycle<InMemoryFlowStore>,
    pub store: Arc<InMemoryFlowStore>,
    pub transport: Arc<ChannelTransport>,
    pub client_id: ClientId,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    /// Engine with a registered client (not connected yet)
    pub async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryFlowStore::new());
        let client_id = ClientId::new(CLIENT_ID).unwrap();
        store
            .write_client(ClientRecord::new(client_id.clone()))
            .await
            .unwrap();

        let mut flows = FlowRegistry::new();
        register_builtins(&mut flows);
        flows.register::<DummyFlowWithSingleReply>();
        flows.register::<DummyLogFlow>();

        let transport = Arc::new(ChannelTransport::new());
        let dispatcher = ClientActionDispatcher::new(transport.clone(), config.dispatcher.clone());
        let runner = FlowRunner::new(
            store.clone(),
            Arc::new(flows),
            Arc::new(OutputPluginRegistry::with_builtins()),
            dispatcher,
            config.runner.clone(),
        );

        Self {
            lifecycle: FlowLifecycle::new(runner, config.export_command_prefix),
            store,
            transport,
            client_id,
        }
    }

    pub fn dispatcher(&self) -> ClientActionDispatcher {
        self.lifecycle.runner().dispatcher().clone()
    }

    /// Connect the client and hand back its inbox
    pub fn connect(&self) -> mpsc::UnboundedReceiver<ClientMessage> {
        self.transport.connect(self.client_id.clone())
    }

    /// Connect the client and answer everything with `mock`
    pub fn connect_mock(&self, mock: MockClient) -> JoinHandle<()> {
        mock.spawn(self.connect(), self.dispatcher())
    }

    pub async fn create(&self, flow_type: &str, args: serde_json::Value) -> FlowRecord {
        self.create_with(flow_type, args, RunnerArgs::default()).await
    }

    pub async fn create_with(
        &self,
        flow_type: &str,
        args: serde_json::Value,
        runner_args: RunnerArgs,
    ) -> FlowRecord {
        self.lifecycle
            .create_flow(&Principal::new("test"), CLIENT_ID, flow_type, args, runner_args)
            .await
            .unwrap()
    }

    /// Poll until the flow reaches `status`
    pub async fn wait_for_status(&self, flow_id: &FlowId, status: FlowStatus) -> FlowRecord {
        let key = FlowKey::new(self.client_id.clone(), flow_id.clone());
        let poll = async {
            loop {
                let record = self.store.read_flow(&key).await.unwrap();
                if record.status == status {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("flow {flow_id} never reached {status}"))
    }
}

/// Receive the next delivered request, failing the test after a while
pub async fn next_message(inbox: &mut mpsc::UnboundedReceiver<ClientMessage>) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("no request delivered in time")
        .expect("transport closed")
}

type Responder = Box<dyn Fn(&ClientMessage) -> Option<ClientResponse> + Send + Sync>;

/// Simulated client answering client actions
///
/// Actions without a configured answer get an error response.
pub struct MockClient {
    responders: Vec<(String, Responder)>,
}

impl MockClient {
    pub fn new() -> Self {
        Self { responders: vec![] }
    }

    /// Answer `ListProcesses` with the given processes
    pub fn list_processes(processes: Vec<Process>) -> Self {
        let payloads: Vec<serde_json::Value> = processes
            .iter()
            .map(|p| serde_json::to_value(p).unwrap())
            .collect();
        Self::new().on("ListProcesses", move |_| {
            Some(ClientResponse::ok(payloads.clone()))
        })
    }

    /// Answer `StatFile` and `TransferBuffer` for any path
    pub fn with_files(self) -> Self {
        self.on("StatFile", |message| {
            let path = message.payload["path"].clone();
            Some(ClientResponse::ok(vec![json!({"path": path, "st_size": 16})]))
        })
        .on("TransferBuffer", |_| Some(ClientResponse::ok(vec![])))
    }

    /// Answer `action` with `responder`; `None` leaves the request unanswered
    pub fn on(
        mut self,
        action: &str,
        responder: impl Fn(&ClientMessage) -> Option<ClientResponse> + Send + Sync + 'static,
    ) -> Self {
        self.responders
            .push((action.to_string(), Box::new(responder)));
        self
    }

    fn respond(&self, message: &ClientMessage) -> Option<ClientResponse> {
        match self.responders.iter().find(|(a, _)| a == &message.action) {
            Some((_, responder)) => responder(message),
            None => Some(ClientResponse::error(format!(
                "unsupported action: {}",
                message.action
            ))),
        }
    }

    pub fn spawn(
        self,
        mut inbox: mpsc::UnboundedReceiver<ClientMessage>,
        dispatcher: ClientActionDispatcher,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if let Some(response) = self.respond(&message) {
                    dispatcher
                        .on_response(
                            message.client_id,
                            message.flow_id,
                            message.request_id,
                            response,
                        )
                        .await;
                }
            }
        })
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}
