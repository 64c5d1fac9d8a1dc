//! Flow lifecycle API
//!
//! The surface an API layer calls into: enumerating flow and output plugin
//! types, creating and stopping flows, and paging through what flows
//! produced. Identifiers arrive as strings and are validated here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::runner::{EngineError, FlowRunner};
use crate::config::EngineConfig;
use crate::dispatch::{ClientActionDispatcher, ClientTransport};
use crate::flow::{
    ClientId, FlowDescriptor, FlowId, FlowKey, FlowLogEntry, FlowRecord, FlowRequest, FlowResult,
    RunnerArgs, UserNotification,
};
use crate::flows::builtin_registry;
use crate::output::{
    OutputPluginLogEntry, OutputPluginRegistry, OutputPluginState, OutputPluginTypeDescriptor,
};
use crate::persistence::{FlowFilter, FlowStore, Pagination};

/// Authenticated caller, as vouched for by the access control layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// One page of a listing plus the size of the whole listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total_count: usize,
}

impl<T> ListPage<T> {
    fn paginate(items: Vec<T>, page: Pagination) -> Self {
        let total_count = items.len();
        Self {
            items: page.apply(items),
            total_count,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Filter for [`FlowLifecycle::list_flow_results`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultFilter {
    /// Keep results whose textual form contains this string
    pub substring: Option<String>,
    pub case_insensitive: bool,
    pub payload_type: Option<String>,
    pub page: Pagination,
}

impl ResultFilter {
    pub fn containing(substring: impl Into<String>) -> Self {
        Self {
            substring: Some(substring.into()),
            ..Default::default()
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn with_page(mut self, page: Pagination) -> Self {
        self.page = page;
        self
    }

    fn matches(&self, result: &FlowResult) -> bool {
        if let Some(payload_type) = &self.payload_type {
            if &result.payload_type != payload_type {
                return false;
            }
        }
        match &self.substring {
            None => true,
            Some(needle) if self.case_insensitive => result
                .search_text()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Some(needle) => result.search_text().contains(needle.as_str()),
        }
    }
}

fn flow_key(client_id: &str, flow_id: &str) -> Result<FlowKey, EngineError> {
    Ok(FlowKey::new(ClientId::new(client_id)?, FlowId::new(flow_id)?))
}

/// Lifecycle API over a flow runner
pub struct FlowLifecycle<S: FlowStore> {
    runner: Arc<FlowRunner<S>>,
    export_command_prefix: String,
}

impl<S: FlowStore> FlowLifecycle<S> {
    pub fn new(runner: Arc<FlowRunner<S>>, export_command_prefix: impl Into<String>) -> Self {
        Self {
            runner,
            export_command_prefix: export_command_prefix.into(),
        }
    }

    /// Wire up dispatcher, runner and the built-in flow and plugin registries
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(store: Arc<S>, transport: Arc<dyn ClientTransport>, config: &EngineConfig) -> Self {
        let dispatcher = ClientActionDispatcher::new(transport, config.dispatcher.clone());
        let runner = FlowRunner::new(
            store,
            builtin_registry(),
            Arc::new(OutputPluginRegistry::with_builtins()),
            dispatcher,
            config.runner.clone(),
        );
        Self::new(runner, config.export_command_prefix.clone())
    }

    pub fn runner(&self) -> &Arc<FlowRunner<S>> {
        &self.runner
    }

    fn store(&self) -> &Arc<S> {
        self.runner.store()
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Available flow types, sorted by name
    pub fn list_flow_descriptors(&self) -> Vec<FlowDescriptor> {
        self.runner.flows().descriptors()
    }

    /// Available output plugin types, sorted by name
    pub fn list_output_plugin_descriptors(&self) -> Vec<OutputPluginTypeDescriptor> {
        self.runner.plugins().descriptors()
    }

    // =========================================================================
    // Flow control
    // =========================================================================

    /// Create and start a flow on a client
    ///
    /// Unknown flow types, bad arguments and unknown output plugins are
    /// validation errors; nothing is persisted in that case.
    #[instrument(skip(self, principal, args, runner_args), fields(user = %principal.username))]
    pub async fn create_flow(
        &self,
        principal: &Principal,
        client_id: &str,
        flow_type: &str,
        args: serde_json::Value,
        runner_args: RunnerArgs,
    ) -> Result<FlowRecord, EngineError> {
        let client_id = ClientId::new(client_id)?;
        let record = self
            .runner
            .start(client_id, flow_type, args, runner_args, &principal.username)
            .await?;
        info!(flow = %record.key, status = %record.status, "flow created by user");
        Ok(record)
    }

    pub async fn get_flow(&self, client_id: &str, flow_id: &str) -> Result<FlowRecord, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        Ok(self.store().read_flow(&key).await?)
    }

    /// Stop a running flow on behalf of the principal
    #[instrument(skip(self, principal), fields(user = %principal.username))]
    pub async fn cancel_flow(
        &self,
        principal: &Principal,
        client_id: &str,
        flow_id: &str,
    ) -> Result<FlowRecord, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        self.runner.cancel(&key, &principal.username).await
    }

    /// Stop a running flow with an explicit reason
    #[instrument(skip(self, principal), fields(user = %principal.username))]
    pub async fn terminate_flow(
        &self,
        principal: &Principal,
        client_id: &str,
        flow_id: &str,
        reason: &str,
    ) -> Result<FlowRecord, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        self.runner.terminate(&key, reason).await
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Flows of a client, newest first
    pub async fn list_flows(
        &self,
        client_id: &str,
        filter: &FlowFilter,
        page: Pagination,
    ) -> Result<ListPage<FlowRecord>, EngineError> {
        let client_id = ClientId::new(client_id)?;
        let flows = self
            .store()
            .list_flows(&client_id, filter, Pagination::all())
            .await?;
        Ok(ListPage::paginate(flows, page))
    }

    /// Requests issued by a flow, ordered by request id
    pub async fn list_flow_requests(
        &self,
        client_id: &str,
        flow_id: &str,
        page: Pagination,
    ) -> Result<ListPage<FlowRequest>, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        let requests = self.store().list_requests(&key, Pagination::all()).await?;
        Ok(ListPage::paginate(requests, page))
    }

    /// Results of a flow, ordered by index
    ///
    /// `total_count` counts the results matching the filter.
    pub async fn list_flow_results(
        &self,
        client_id: &str,
        flow_id: &str,
        filter: &ResultFilter,
    ) -> Result<ListPage<FlowResult>, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        let results: Vec<FlowResult> = self
            .store()
            .read_results(&key)
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        Ok(ListPage::paginate(results, filter.page))
    }

    /// Log entries of a flow, ordered by timestamp
    pub async fn list_flow_logs(
        &self,
        client_id: &str,
        flow_id: &str,
        page: Pagination,
    ) -> Result<ListPage<FlowLogEntry>, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        let logs = self.store().read_logs(&key).await?;
        Ok(ListPage::paginate(logs, page))
    }

    /// Output plugin instances of a flow in declaration order
    pub async fn list_flow_output_plugins(
        &self,
        client_id: &str,
        flow_id: &str,
    ) -> Result<Vec<OutputPluginState>, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        Ok(self.store().read_plugin_states(&key).await?)
    }

    pub async fn list_flow_output_plugin_logs(
        &self,
        client_id: &str,
        flow_id: &str,
        plugin_id: &str,
        page: Pagination,
    ) -> Result<ListPage<OutputPluginLogEntry>, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        let logs = self.store().read_plugin_logs(&key, plugin_id).await?;
        Ok(ListPage::paginate(logs, page))
    }

    pub async fn list_flow_output_plugin_errors(
        &self,
        client_id: &str,
        flow_id: &str,
        plugin_id: &str,
        page: Pagination,
    ) -> Result<ListPage<OutputPluginLogEntry>, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        let errors = self.store().read_plugin_errors(&key, plugin_id).await?;
        Ok(ListPage::paginate(errors, page))
    }

    /// Shell command that downloads the flow's results as an archive
    pub async fn get_flow_results_export_command(
        &self,
        client_id: &str,
        flow_id: &str,
    ) -> Result<String, EngineError> {
        let key = flow_key(client_id, flow_id)?;
        self.store().read_flow(&key).await?;

        let filename = format!("flow_results_{}_{}", key.client_id, key.flow_id).replace('.', "_");
        Ok(format!(
            "{} --exec_code 'api.Client(\"{}\").Flow(\"{}\").GetFilesArchive().WriteToFile(\"./{}.zip\")'",
            self.export_command_prefix, key.client_id, key.flow_id, filename
        ))
    }

    /// Notifications addressed to the principal, oldest first
    pub async fn list_notifications(
        &self,
        principal: &Principal,
    ) -> Result<Vec<UserNotification>, EngineError> {
        Ok(self
            .store()
            .read_notifications(&principal.username)
            .await?)
    }
}

impl<S: FlowStore> std::fmt::Debug for FlowLifecycle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowLifecycle")
            .field("runner", &self.runner)
            .field("export_command_prefix", &self.export_command_prefix)
            .finish()
    }
}
