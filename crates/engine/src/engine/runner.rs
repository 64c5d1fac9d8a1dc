//! Flow runner
//!
//! The `FlowRunner` drives flow instances from start to a terminal state:
//! - Starting new flows and their child flows
//! - Advancing flows when responses to their requests arrive
//! - Persisting requests, results and log entries emitted by state handlers
//! - Terminating and cancelling flows
//!
//! All transitions of one flow are serialized by a per-flow lock. Work that
//! touches another flow (starting a child, answering a parent, terminating
//! children) is collected as follow-ups and run once that lock is released.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::registry::{AnyFlow, CreatedFlow, FlowRegistry, RegistryError};
use crate::dispatch::{ClientActionDispatcher, DispatchError, ResponseHandler};
use crate::flow::{
    ClientId, ClientResponse, FlowAction, FlowId, FlowKey, FlowLogEntry, FlowRecord, FlowRequest,
    FlowResult, FlowStatus, IdError, InvalidTransition, ParentLink, RequestId, RequestState,
    RequestTarget, RunnerArgs, UserNotification,
};
use crate::output::{
    plugin_instance_ids, OutputPipeline, OutputPluginRegistry, OutputPluginState,
};
use crate::persistence::{FlowStore, StoreError};
use crate::reliability::duration_millis;

/// Configuration for the flow runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Upper bound on a single state handler invocation
    #[serde(with = "duration_millis")]
    pub processing_budget: Duration,

    /// Random flow ids tried before giving up on a client
    pub max_flow_id_attempts: u32,

    /// Largest batch of results handed to the output pipeline at once
    pub max_results_per_batch: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            processing_budget: Duration::from_secs(30),
            max_flow_id_attempts: 16,
            max_results_per_batch: 100,
        }
    }
}

impl RunnerConfig {
    pub fn with_processing_budget(mut self, budget: Duration) -> Self {
        self.processing_budget = budget;
        self
    }

    pub fn with_max_results_per_batch(mut self, max: usize) -> Self {
        self.max_results_per_batch = max.max(1);
        self
    }
}

/// Errors from runner and lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller supplied something unacceptable
    #[error("validation error: {0}")]
    Validation(String),

    /// Addressed client, flow or plugin does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Registry error (unknown flow type, bad arguments)
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Disallowed status change
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the caller's input was rejected
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Registry(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        if error.is_not_found() {
            Self::NotFound(error.to_string())
        } else {
            Self::Store(error)
        }
    }
}

impl From<IdError> for EngineError {
    fn from(error: IdError) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Which state handler to invoke
enum Invocation {
    Start,
    Response {
        request_id: RequestId,
        next_state: String,
        response: ClientResponse,
    },
    Complete,
}

impl Invocation {
    /// Request whose response triggered the invocation (0 otherwise)
    fn source_request(&self) -> RequestId {
        match self {
            Self::Response { request_id, .. } => *request_id,
            _ => 0,
        }
    }
}

/// Work on other flows, run after the current flow's lock is released
enum FollowUp {
    StartChild(FlowKey),
    AnswerParent {
        parent: FlowKey,
        request_id: RequestId,
        response: ClientResponse,
    },
    TerminateChildren {
        children: Vec<FlowKey>,
        reason: String,
    },
}

/// Flow runner
///
/// Created behind an `Arc` because it registers itself with the dispatcher
/// as the receiver of client responses.
///
/// # Example
///
/// ```ignore
/// let dispatcher = ClientActionDispatcher::new(transport, DispatcherConfig::default());
/// let runner = FlowRunner::new(store, builtin_registry(), plugins, dispatcher, RunnerConfig::default());
///
/// let record = runner
///     .start(client_id, "ListProcesses", json!({}), RunnerArgs::default(), "alice")
///     .await?;
/// ```
pub struct FlowRunner<S: FlowStore> {
    store: Arc<S>,
    flows: Arc<FlowRegistry>,
    plugins: Arc<OutputPluginRegistry>,
    dispatcher: ClientActionDispatcher,
    outputs: OutputPipeline,
    config: RunnerConfig,
    locks: DashMap<FlowKey, Arc<tokio::sync::Mutex<()>>>,
}

impl<S: FlowStore> FlowRunner<S> {
    /// Create a runner and attach it to the dispatcher
    ///
    /// Must be called from within a tokio runtime (spawns the output
    /// pipeline worker).
    pub fn new(
        store: Arc<S>,
        flows: Arc<FlowRegistry>,
        plugins: Arc<OutputPluginRegistry>,
        dispatcher: ClientActionDispatcher,
        config: RunnerConfig,
    ) -> Arc<Self> {
        let outputs = OutputPipeline::spawn(store.clone(), plugins.clone());
        Arc::new_cyclic(|runner: &Weak<Self>| {
            let handler: Weak<dyn ResponseHandler> = runner.clone();
            dispatcher.set_handler(handler);
            Self {
                store,
                flows,
                plugins,
                dispatcher,
                outputs,
                config,
                locks: DashMap::new(),
            }
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn flows(&self) -> &Arc<FlowRegistry> {
        &self.flows
    }

    pub fn plugins(&self) -> &Arc<OutputPluginRegistry> {
        &self.plugins
    }

    pub fn dispatcher(&self) -> &ClientActionDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Wait until every result written so far went through the output plugins
    pub async fn flush_outputs(&self) {
        self.outputs.flush().await;
    }

    /// Flows with a lock entry, i.e. running or mid-transition
    pub fn active_flow_count(&self) -> usize {
        self.locks.len()
    }

    fn lock_for(&self, key: &FlowKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the lock of a flow that is missing or no longer running
    ///
    /// Takes the caller's clone of the lock. The entry stays while anyone
    /// else holds or waits on it; the last one out removes it.
    fn forget_idle_lock(&self, key: &FlowKey, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Create and start a top-level flow
    ///
    /// Arguments and output plugin descriptors are validated before anything
    /// is persisted. Returns the record as it stands after the start handler
    /// ran.
    #[instrument(skip_all, fields(client_id = %client_id, flow_type = %flow_type))]
    pub async fn start(
        &self,
        client_id: ClientId,
        flow_type: &str,
        args: serde_json::Value,
        runner_args: RunnerArgs,
        creator: &str,
    ) -> Result<FlowRecord, EngineError> {
        for descriptor in &runner_args.output_plugins {
            self.plugins
                .validate(descriptor)
                .map_err(|e| EngineError::Validation(e.to_string()))?;
        }

        let CreatedFlow { flow, args } = self.flows.create(flow_type, args)?;
        self.store.read_client(&client_id).await?;

        let mut record = FlowRecord::new(
            FlowKey::new(client_id, FlowId::random()),
            flow_type,
            args,
            runner_args,
            creator,
        );
        record.state = flow.save_state()?;
        record.output_plugin_ids = plugin_instance_ids(&record.runner_args.output_plugins);

        let record = self.insert_record(record).await?;
        for (plugin_id, descriptor) in record
            .output_plugin_ids
            .iter()
            .zip(&record.runner_args.output_plugins)
        {
            self.store
                .write_plugin_state(
                    &record.key,
                    OutputPluginState::new(plugin_id.clone(), descriptor.clone()),
                )
                .await?;
        }

        info!(flow_id = %record.key.flow_id, "flow created");
        self.run_start(&record.key).await?;
        Ok(self.store.read_flow(&record.key).await?)
    }

    /// Persist a new record, drawing a fresh flow id on collision
    async fn insert_record(&self, mut record: FlowRecord) -> Result<FlowRecord, EngineError> {
        for _ in 0..self.config.max_flow_id_attempts.max(1) {
            match self.store.create_flow(record.clone()).await {
                Ok(()) => return Ok(record),
                Err(StoreError::AlreadyExists(key)) => {
                    debug!(%key, "flow id taken, drawing another");
                    record.key.flow_id = FlowId::random();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Store(StoreError::Backend(format!(
            "no free flow id on client {} after {} attempts",
            record.key.client_id, self.config.max_flow_id_attempts
        ))))
    }

    /// Run the start handler of a persisted, not yet started flow
    async fn run_start(&self, key: &FlowKey) -> Result<(), EngineError> {
        let follow_ups = {
            let lock = self.lock_for(key);
            let guard = lock.lock().await;

            let record = self.store.read_flow(key).await?;
            if record.status != FlowStatus::Running {
                debug!(%key, status = %record.status, "flow not running, start skipped");
                drop(guard);
                self.forget_idle_lock(key, lock);
                return Ok(());
            }
            self.step(record, Invocation::Start).await?
        };
        self.run_follow_ups(follow_ups).await;
        Ok(())
    }

    // =========================================================================
    // Advance
    // =========================================================================

    /// Feed the response to one request into its flow
    ///
    /// Responses for flows that are no longer running, and duplicate
    /// responses for requests already resolved, are dropped.
    #[instrument(skip_all, fields(flow = %key, request_id = request_id))]
    pub async fn advance(
        &self,
        key: &FlowKey,
        request_id: RequestId,
        response: ClientResponse,
        outcome: RequestState,
    ) -> Result<(), EngineError> {
        let follow_ups = {
            let lock = self.lock_for(key);
            let guard = lock.lock().await;

            let record = match self.store.read_flow(key).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    debug!("response for unknown flow dropped");
                    drop(guard);
                    self.forget_idle_lock(key, lock);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if record.status != FlowStatus::Running {
                debug!(status = %record.status, "late response dropped");
                drop(guard);
                self.forget_idle_lock(key, lock);
                return Ok(());
            }

            let request = match self
                .store
                .resolve_request(key, request_id, outcome, Some(response.clone()))
                .await
            {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("duplicate response dropped");
                    return Ok(());
                }
                Err(StoreError::RequestNotFound { .. }) => {
                    debug!("response for unknown request dropped");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            self.step(
                record,
                Invocation::Response {
                    request_id,
                    next_state: request.next_state,
                    response,
                },
            )
            .await?
        };
        self.run_follow_ups(follow_ups).await;
        Ok(())
    }

    /// Invoke a state handler and persist its effects
    ///
    /// Runs the completion handler as well once nothing is outstanding.
    /// The caller holds the flow lock.
    async fn step(
        &self,
        mut record: FlowRecord,
        invocation: Invocation,
    ) -> Result<Vec<FollowUp>, EngineError> {
        let mut flow = match self.flows.restore(&record.flow_type, record.state.clone()) {
            Ok(flow) => flow,
            Err(e) => return self.fail(record, e.to_string()).await,
        };

        let mut follow_ups = vec![];
        let mut invocation = invocation;
        let finished = loop {
            let completing = matches!(invocation, Invocation::Complete);
            let source = invocation.source_request();

            let (next, actions) = match self.invoke(flow, invocation).await {
                Ok(invoked) => invoked,
                Err(message) => return self.fail(record, message).await,
            };
            flow = next;

            let children = match self.prepare_children(&actions) {
                Ok(children) => children,
                Err(e) => return self.fail(record, e.to_string()).await,
            };
            let persisted = self
                .persist_step(&mut record, flow.as_ref(), source, actions, children, &mut follow_ups)
                .await;
            let (requests, results) = match persisted {
                Ok(persisted) => persisted,
                Err(e) => {
                    // Children created by this step are terminated by `fail`, never started
                    follow_ups.retain(|f| !matches!(f, FollowUp::StartChild(_)));
                    follow_ups.extend(self.fail(record, e.to_string()).await?);
                    return Ok(follow_ups);
                }
            };
            self.dispatch(&record.key, &requests);
            self.submit_results(&record, results);

            if self.store.count_pending_requests(&record.key).await? > 0 {
                break false;
            }
            if completing {
                break true;
            }
            invocation = Invocation::Complete;
        };

        if finished {
            follow_ups.extend(self.finish(record).await?);
        }
        Ok(follow_ups)
    }

    /// Run a handler on the blocking pool within the processing budget
    async fn invoke(
        &self,
        mut flow: Box<dyn AnyFlow>,
        invocation: Invocation,
    ) -> Result<(Box<dyn AnyFlow>, Vec<FlowAction>), String> {
        let budget = self.config.processing_budget;
        let task = tokio::task::spawn_blocking(move || {
            let actions = match invocation {
                Invocation::Start => flow.on_start(),
                Invocation::Response {
                    next_state,
                    response,
                    ..
                } => flow.on_response(&next_state, response),
                Invocation::Complete => flow.on_complete(),
            };
            (flow, actions)
        });

        match tokio::time::timeout(budget, task).await {
            Err(_) => Err(format!(
                "processing budget of {} ms exceeded",
                budget.as_millis()
            )),
            Ok(Err(join_error)) => Err(format!("flow handler panicked: {join_error}")),
            Ok(Ok((_, Err(flow_error)))) => Err(flow_error.to_string()),
            Ok(Ok((flow, Ok(actions)))) => Ok((flow, actions)),
        }
    }

    /// Build every child flow requested by `actions` before anything is written
    fn prepare_children(&self, actions: &[FlowAction]) -> Result<Vec<CreatedFlow>, RegistryError> {
        actions
            .iter()
            .filter_map(|action| match action {
                FlowAction::CallFlow {
                    flow_name, args, ..
                } => Some(self.flows.create(flow_name, args.clone())),
                _ => None,
            })
            .collect()
    }

    /// Save the continuation state and the effects of one handler invocation
    ///
    /// On error nothing is saved to the record itself, so the caller can
    /// still move it to Error.
    async fn persist_step(
        &self,
        record: &mut FlowRecord,
        flow: &dyn AnyFlow,
        source: RequestId,
        actions: Vec<FlowAction>,
        children: Vec<CreatedFlow>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<(Vec<FlowRequest>, Vec<FlowResult>), EngineError> {
        record.state = flow.save_state()?;
        let applied = self
            .apply_actions(record, source, actions, children, follow_ups)
            .await?;
        self.save(record).await?;
        Ok(applied)
    }

    /// Persist the effects of handler actions
    ///
    /// Returns the client requests still to be dispatched and the results
    /// as written by the store.
    async fn apply_actions(
        &self,
        record: &mut FlowRecord,
        source: RequestId,
        actions: Vec<FlowAction>,
        children: Vec<CreatedFlow>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<(Vec<FlowRequest>, Vec<FlowResult>), EngineError> {
        let mut children = children.into_iter();
        let mut requests = vec![];
        let mut client_requests = vec![];
        let mut results = vec![];
        let mut logs = vec![];

        for action in actions {
            match action {
                FlowAction::CallClient {
                    action,
                    payload,
                    next_state,
                } => {
                    let request = FlowRequest::new(
                        record.allocate_request_id(),
                        RequestTarget::ClientAction { action },
                        payload,
                        next_state,
                    );
                    client_requests.push(request.clone());
                    requests.push(request);
                }
                FlowAction::CallFlow {
                    flow_name,
                    next_state,
                    ..
                } => {
                    let Some(created) = children.next() else {
                        continue;
                    };
                    let request_id = record.allocate_request_id();
                    let child_args = created.args.clone();
                    let child = self.create_child(record, request_id, created).await?;

                    record.child_flow_ids.push(child.key.flow_id.clone());
                    requests.push(FlowRequest::new(
                        request_id,
                        RequestTarget::ChildFlow {
                            flow_name,
                            flow_id: child.key.flow_id.clone(),
                        },
                        child_args,
                        next_state,
                    ));
                    follow_ups.push(FollowUp::StartChild(child.key));
                }
                FlowAction::SendReply {
                    payload_type,
                    payload,
                } => results.push(FlowResult {
                    client_id: record.key.client_id.clone(),
                    flow_id: record.key.flow_id.clone(),
                    request_id: source,
                    index: 0,
                    payload_type,
                    payload,
                    timestamp: Utc::now(),
                }),
                FlowAction::Log { message } => logs.push(FlowLogEntry::new(&record.key, message)),
            }
        }

        if !requests.is_empty() {
            self.store.write_requests(&record.key, requests).await?;
        }
        let results = if results.is_empty() {
            results
        } else {
            self.store.write_results(&record.key, results).await?
        };
        record.result_count += results.len() as u64;
        for entry in logs {
            self.store.append_log(entry).await?;
        }

        Ok((client_requests, results))
    }

    async fn create_child(
        &self,
        parent: &FlowRecord,
        request_id: RequestId,
        created: CreatedFlow,
    ) -> Result<FlowRecord, EngineError> {
        let mut child = FlowRecord::new(
            FlowKey::new(parent.key.client_id.clone(), FlowId::random()),
            created.flow.flow_type(),
            created.args,
            RunnerArgs::default(),
            parent.creator.clone(),
        );
        child.parent = Some(ParentLink {
            flow_id: parent.key.flow_id.clone(),
            request_id,
        });
        child.state = created.flow.save_state()?;

        let child = self.insert_record(child).await?;
        debug!(parent = %parent.key, child = %child.key, "child flow created");
        Ok(child)
    }

    fn dispatch(&self, key: &FlowKey, requests: &[FlowRequest]) {
        for request in requests {
            match self.dispatcher.send(key, request) {
                Ok(()) => {}
                Err(DispatchError::FlowCancelled(_)) => {
                    debug!(%key, request_id = request.request_id, "flow cancelled, request not sent");
                }
                Err(e) => warn!(%key, request_id = request.request_id, error = %e, "request not sent"),
            }
        }
    }

    fn submit_results(&self, record: &FlowRecord, results: Vec<FlowResult>) {
        if record.output_plugin_ids.is_empty() || results.is_empty() {
            return;
        }
        let batch_size = self.config.max_results_per_batch.max(1);
        for batch in results.chunks(batch_size) {
            self.outputs.submit(record.key.clone(), batch.to_vec());
        }
    }

    async fn save(&self, record: &mut FlowRecord) -> Result<(), EngineError> {
        record.last_update_at = Utc::now();
        record.version = self.store.update_flow(record.clone()).await?;
        Ok(())
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    /// Natural completion: nothing outstanding and the completion handler
    /// issued no new work
    async fn finish(&self, mut record: FlowRecord) -> Result<Vec<FollowUp>, EngineError> {
        record.transition(FlowStatus::Terminated)?;
        self.save(&mut record).await?;
        self.release(&record.key);
        info!(flow = %record.key, results = record.result_count, "flow completed");

        self.notify_creator(
            &record,
            format!("Flow {} ({}) completed", record.flow_type, record.key),
        )
        .await?;

        let mut follow_ups = vec![];
        if let Some(parent) = &record.parent {
            let payloads = self
                .store
                .read_results(&record.key)
                .await?
                .into_iter()
                .map(|r| r.payload)
                .collect();
            follow_ups.push(FollowUp::AnswerParent {
                parent: FlowKey::new(record.key.client_id.clone(), parent.flow_id.clone()),
                request_id: parent.request_id,
                response: ClientResponse::ok(payloads),
            });
        }
        Ok(follow_ups)
    }

    /// Fatal processing error: the flow moves to Error and is never retried
    async fn fail(
        &self,
        mut record: FlowRecord,
        message: String,
    ) -> Result<Vec<FollowUp>, EngineError> {
        warn!(flow = %record.key, error = %message, "flow failed");

        record.transition(FlowStatus::Error)?;
        record.error_message = Some(message.clone());
        self.save(&mut record).await?;

        self.store
            .append_log(FlowLogEntry::new(&record.key, message.clone()))
            .await?;
        self.store.abandon_requests(&record.key).await?;
        self.release(&record.key);

        self.notify_creator(
            &record,
            format!("Flow {} ({}) failed: {message}", record.flow_type, record.key),
        )
        .await?;

        let mut follow_ups = vec![FollowUp::TerminateChildren {
            children: self.child_keys(&record),
            reason: format!("Parent flow {} failed", record.key.flow_id),
        }];
        if let Some(parent) = &record.parent {
            follow_ups.push(FollowUp::AnswerParent {
                parent: FlowKey::new(record.key.client_id.clone(), parent.flow_id.clone()),
                request_id: parent.request_id,
                response: ClientResponse::error(format!(
                    "child flow {} failed: {message}",
                    record.key.flow_id
                )),
            });
        }
        Ok(follow_ups)
    }

    /// Terminate a running flow
    ///
    /// Running → TerminatedPending → Terminated. Outstanding requests are
    /// abandoned, the flow's dispatcher timers cancelled and running child
    /// flows terminated with the same reason. Terminating a flow that is
    /// already terminal is an [`InvalidTransition`] error.
    #[instrument(skip_all, fields(flow = %key))]
    pub async fn terminate(&self, key: &FlowKey, reason: &str) -> Result<FlowRecord, EngineError> {
        let (record, follow_ups) = {
            let lock = self.lock_for(key);
            let guard = lock.lock().await;

            let read = self.store.read_flow(key).await.map_err(EngineError::from);
            let mut record = match read.and_then(|mut record| {
                record.transition(FlowStatus::TerminatedPending)?;
                Ok(record)
            }) {
                Ok(record) => record,
                Err(e) => {
                    drop(guard);
                    self.forget_idle_lock(key, lock);
                    return Err(e);
                }
            };
            record.pending_termination = Some(reason.to_string());
            self.save(&mut record).await?;

            let abandoned = self.store.abandon_requests(key).await?;
            self.dispatcher.cancel_flow(key);
            self.store
                .append_log(FlowLogEntry::new(key, format!("Flow terminated: {reason}")))
                .await?;

            record.transition(FlowStatus::Terminated)?;
            self.save(&mut record).await?;
            self.release(key);
            info!(abandoned = abandoned.len(), reason, "flow terminated");

            self.notify_creator(
                &record,
                format!("Flow {} ({}) terminated: {reason}", record.flow_type, record.key),
            )
            .await?;

            let mut follow_ups = vec![FollowUp::TerminateChildren {
                children: self.child_keys(&record),
                reason: reason.to_string(),
            }];
            if let Some(parent) = &record.parent {
                follow_ups.push(FollowUp::AnswerParent {
                    parent: FlowKey::new(key.client_id.clone(), parent.flow_id.clone()),
                    request_id: parent.request_id,
                    response: ClientResponse::error(format!(
                        "child flow {} terminated: {reason}",
                        key.flow_id
                    )),
                });
            }
            (record, follow_ups)
        };

        self.run_follow_ups(follow_ups).await;
        Ok(record)
    }

    /// Terminate a flow on behalf of a user
    pub async fn cancel(&self, key: &FlowKey, username: &str) -> Result<FlowRecord, EngineError> {
        self.terminate(key, &format!("Cancelled by user {username}"))
            .await
    }

    fn child_keys(&self, record: &FlowRecord) -> Vec<FlowKey> {
        record
            .child_flow_ids
            .iter()
            .map(|id| FlowKey::new(record.key.client_id.clone(), id.clone()))
            .collect()
    }

    /// Drop dispatcher state and the lock entry of a flow that reached a
    /// terminal state
    fn release(&self, key: &FlowKey) {
        self.dispatcher.release_flow(key);
        self.locks.remove(key);
    }

    async fn notify_creator(&self, record: &FlowRecord, message: String) -> Result<(), EngineError> {
        if !record.runner_args.notify_to_user {
            return Ok(());
        }
        self.store
            .write_notification(UserNotification {
                id: Uuid::now_v7(),
                username: record.creator.clone(),
                flow: record.key.clone(),
                message,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Boxed because follow-ups start, advance and terminate other flows,
    /// which may produce follow-ups of their own
    fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) -> BoxFuture<'_, ()> {
        async move {
            for follow_up in follow_ups {
                match follow_up {
                    FollowUp::StartChild(key) => {
                        if let Err(e) = self.run_start(&key).await {
                            warn!(%key, error = %e, "failed to start child flow");
                        }
                    }
                    FollowUp::AnswerParent {
                        parent,
                        request_id,
                        response,
                    } => {
                        if let Err(e) = self
                            .advance(&parent, request_id, response, RequestState::Answered)
                            .await
                        {
                            warn!(%parent, request_id, error = %e, "failed to answer parent flow");
                        }
                    }
                    FollowUp::TerminateChildren { children, reason } => {
                        for child in children {
                            match self.terminate(&child, &reason).await {
                                Ok(_) | Err(EngineError::InvalidTransition(_)) => {}
                                Err(e) => {
                                    warn!(%child, error = %e, "failed to terminate child flow")
                                }
                            }
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl<S: FlowStore> ResponseHandler for FlowRunner<S> {
    async fn handle_response(
        &self,
        key: FlowKey,
        request_id: RequestId,
        response: ClientResponse,
        outcome: RequestState,
    ) {
        if let Err(e) = self.advance(&key, request_id, response, outcome).await {
            warn!(%key, request_id, error = %e, "failed to advance flow");
        }
    }

    async fn delivery_attempted(&self, key: &FlowKey, request_id: RequestId) {
        if let Err(e) = self.store.record_attempt(key, request_id).await {
            debug!(%key, request_id, error = %e, "delivery attempt not recorded");
        }
    }
}

impl<S: FlowStore> std::fmt::Debug for FlowRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRunner")
            .field("flows", &self.flows)
            .field("config", &self.config)
            .field("active_flows", &self.locks.len())
            .finish_non_exhaustive()
    }
}
