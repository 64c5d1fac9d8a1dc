//! FlowStore trait definition

use async_trait::async_trait;

use crate::flow::{
    ClientId, ClientRecord, ClientResponse, FlowKey, FlowLogEntry, FlowRecord, FlowRequest,
    FlowResult, FlowStatus, RequestId, RequestState, UserNotification,
};
use crate::output::{OutputPluginLogEntry, OutputPluginState, PluginBatchRecord};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Flow not found
    #[error("flow not found: {0}")]
    FlowNotFound(FlowKey),

    /// Client not known to the store
    #[error("client not found: {0}")]
    ClientNotFound(ClientId),

    /// A flow with the same key already exists
    #[error("flow already exists: {0}")]
    AlreadyExists(FlowKey),

    /// Optimistic locking failed
    #[error("concurrency conflict on {key}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        key: FlowKey,
        expected: u64,
        actual: u64,
    },

    /// Request not found
    #[error("request {request_id} not found on flow {key}")]
    RequestNotFound { key: FlowKey, request_id: RequestId },

    /// Output plugin instance not found
    #[error("output plugin {plugin_id} not found on flow {key}")]
    PluginNotFound { key: FlowKey, plugin_id: String },

    /// Backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error means the addressed entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FlowNotFound(_)
                | Self::ClientNotFound(_)
                | Self::RequestNotFound { .. }
                | Self::PluginNotFound { .. }
        )
    }
}

/// Offset/count window over an ordered listing
///
/// `count: None` means all remaining entries. An offset past the end
/// yields an empty page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub count: Option<usize>,
}

impl Pagination {
    /// Everything
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(offset: usize, count: Option<usize>) -> Self {
        Self { offset, count }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Apply the window to an already ordered iterator
    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.count {
            Some(count) => iter.take(count).collect(),
            None => iter.collect(),
        }
    }
}

/// Filter for listing flows of a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowFilter {
    /// Exclude child flows
    pub top_level_only: bool,
    pub status: Option<FlowStatus>,
    pub flow_type: Option<String>,
}

impl FlowFilter {
    pub fn top_level() -> Self {
        Self {
            top_level_only: true,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_flow_type(mut self, flow_type: impl Into<String>) -> Self {
        self.flow_type = Some(flow_type.into());
        self
    }

    pub fn matches(&self, record: &FlowRecord) -> bool {
        if self.top_level_only && record.is_child() {
            return false;
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if let Some(flow_type) = &self.flow_type {
            if &record.flow_type != flow_type {
                return false;
            }
        }
        true
    }
}

/// Durable state of flows, their requests, results, logs and plugins
///
/// Implementations must be thread-safe. Every method is atomic with
/// respect to the flow it addresses.
#[async_trait]
pub trait FlowStore: Send + Sync + 'static {
    // =========================================================================
    // Clients
    // =========================================================================

    /// Register a client (idempotent)
    async fn write_client(&self, client: ClientRecord) -> Result<(), StoreError>;

    async fn read_client(&self, client_id: &ClientId) -> Result<ClientRecord, StoreError>;

    // =========================================================================
    // Flows
    // =========================================================================

    /// Persist a new flow record
    ///
    /// Fails with `ClientNotFound` for unknown clients and `AlreadyExists`
    /// when the key is taken.
    async fn create_flow(&self, record: FlowRecord) -> Result<(), StoreError>;

    async fn read_flow(&self, key: &FlowKey) -> Result<FlowRecord, StoreError>;

    /// Replace a flow record
    ///
    /// `record.version` must equal the stored version; the stored copy gets
    /// the next version, which is returned.
    async fn update_flow(&self, record: FlowRecord) -> Result<u64, StoreError>;

    /// Flows of a client, newest first
    async fn list_flows(
        &self,
        client_id: &ClientId,
        filter: &FlowFilter,
        page: Pagination,
    ) -> Result<Vec<FlowRecord>, StoreError>;

    // =========================================================================
    // Requests
    // =========================================================================

    async fn write_requests(
        &self,
        key: &FlowKey,
        requests: Vec<FlowRequest>,
    ) -> Result<(), StoreError>;

    async fn read_request(
        &self,
        key: &FlowKey,
        request_id: RequestId,
    ) -> Result<FlowRequest, StoreError>;

    /// Move a pending request to `state`, attaching `response`
    ///
    /// Returns the updated request, or `None` when the request was already
    /// resolved (duplicate or late response).
    async fn resolve_request(
        &self,
        key: &FlowKey,
        request_id: RequestId,
        state: RequestState,
        response: Option<ClientResponse>,
    ) -> Result<Option<FlowRequest>, StoreError>;

    /// Count a delivery attempt; returns the new attempt count
    async fn record_attempt(&self, key: &FlowKey, request_id: RequestId)
        -> Result<u32, StoreError>;

    /// Abandon every pending request; returns the abandoned ids
    async fn abandon_requests(&self, key: &FlowKey) -> Result<Vec<RequestId>, StoreError>;

    /// Requests ordered by id
    async fn list_requests(
        &self,
        key: &FlowKey,
        page: Pagination,
    ) -> Result<Vec<FlowRequest>, StoreError>;

    async fn count_pending_requests(&self, key: &FlowKey) -> Result<usize, StoreError>;

    // =========================================================================
    // Results
    // =========================================================================

    /// Append results, assigning dense indices; returns them as written
    async fn write_results(
        &self,
        key: &FlowKey,
        results: Vec<FlowResult>,
    ) -> Result<Vec<FlowResult>, StoreError>;

    /// Results ordered by index
    async fn read_results(&self, key: &FlowKey) -> Result<Vec<FlowResult>, StoreError>;

    async fn count_results(&self, key: &FlowKey) -> Result<u64, StoreError>;

    // =========================================================================
    // Logs
    // =========================================================================

    /// Append a log entry; the store assigns its sequence
    async fn append_log(&self, entry: FlowLogEntry) -> Result<(), StoreError>;

    /// Log entries ordered by timestamp, then sequence
    async fn read_logs(&self, key: &FlowKey) -> Result<Vec<FlowLogEntry>, StoreError>;

    // =========================================================================
    // Output plugins
    // =========================================================================

    async fn write_plugin_state(
        &self,
        key: &FlowKey,
        state: OutputPluginState,
    ) -> Result<(), StoreError>;

    /// Plugin states in declaration order
    async fn read_plugin_states(&self, key: &FlowKey)
        -> Result<Vec<OutputPluginState>, StoreError>;

    /// Apply a batch's effects to one plugin instance
    async fn record_plugin_batch(
        &self,
        key: &FlowKey,
        plugin_id: &str,
        batch: PluginBatchRecord,
    ) -> Result<(), StoreError>;

    async fn read_plugin_logs(
        &self,
        key: &FlowKey,
        plugin_id: &str,
    ) -> Result<Vec<OutputPluginLogEntry>, StoreError>;

    async fn read_plugin_errors(
        &self,
        key: &FlowKey,
        plugin_id: &str,
    ) -> Result<Vec<OutputPluginLogEntry>, StoreError>;

    // =========================================================================
    // Notifications
    // =========================================================================

    async fn write_notification(&self, notification: UserNotification) -> Result<(), StoreError>;

    /// Notifications for a user, oldest first
    async fn read_notifications(&self, username: &str)
        -> Result<Vec<UserNotification>, StoreError>;
}
