//! In-memory implementation of FlowStore

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::*;
use crate::flow::{
    ClientId, ClientRecord, ClientResponse, FlowKey, FlowLogEntry, FlowRecord, FlowRequest,
    FlowResult, RequestId, RequestState, UserNotification,
};
use crate::output::{OutputPluginLogEntry, OutputPluginState, PluginBatchRecord};

struct PluginEntry {
    state: OutputPluginState,
    logs: Vec<OutputPluginLogEntry>,
    errors: Vec<OutputPluginLogEntry>,
}

/// Everything stored for one flow
struct FlowEntry {
    record: FlowRecord,
    requests: BTreeMap<RequestId, FlowRequest>,
    results: Vec<FlowResult>,
    logs: Vec<FlowLogEntry>,
    plugins: Vec<PluginEntry>,
}

impl FlowEntry {
    fn plugin_mut(&mut self, key: &FlowKey, plugin_id: &str) -> Result<&mut PluginEntry, StoreError> {
        self.plugins
            .iter_mut()
            .find(|p| p.state.plugin_id == plugin_id)
            .ok_or_else(|| StoreError::PluginNotFound {
                key: key.clone(),
                plugin_id: plugin_id.to_string(),
            })
    }

    fn plugin(&self, key: &FlowKey, plugin_id: &str) -> Result<&PluginEntry, StoreError> {
        self.plugins
            .iter()
            .find(|p| p.state.plugin_id == plugin_id)
            .ok_or_else(|| StoreError::PluginNotFound {
                key: key.clone(),
                plugin_id: plugin_id.to_string(),
            })
    }
}

/// In-memory implementation of FlowStore
///
/// Keeps all data in memory with the same semantics a durable backend must
/// provide. Used by tests and the demo binary.
///
/// # Example
///
/// ```
/// use fleetflow_engine::InMemoryFlowStore;
///
/// let store = InMemoryFlowStore::new();
/// assert_eq!(store.flow_count(), 0);
/// ```
pub struct InMemoryFlowStore {
    clients: RwLock<HashMap<ClientId, ClientRecord>>,
    flows: RwLock<HashMap<FlowKey, FlowEntry>>,
    notifications: RwLock<Vec<UserNotification>>,
    log_sequence: AtomicU64,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            flows: RwLock::new(HashMap::new()),
            notifications: RwLock::new(Vec::new()),
            log_sequence: AtomicU64::new(0),
        }
    }

    /// Number of stored flows
    pub fn flow_count(&self) -> usize {
        self.flows.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.clients.write().clear();
        self.flows.write().clear();
        self.notifications.write().clear();
    }

    fn with_flow<T>(
        &self,
        key: &FlowKey,
        f: impl FnOnce(&FlowEntry) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let flows = self.flows.read();
        let entry = flows
            .get(key)
            .ok_or_else(|| StoreError::FlowNotFound(key.clone()))?;
        f(entry)
    }

    fn with_flow_mut<T>(
        &self,
        key: &FlowKey,
        f: impl FnOnce(&mut FlowEntry) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut flows = self.flows.write();
        let entry = flows
            .get_mut(key)
            .ok_or_else(|| StoreError::FlowNotFound(key.clone()))?;
        f(entry)
    }
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn write_client(&self, client: ClientRecord) -> Result<(), StoreError> {
        self.clients
            .write()
            .entry(client.client_id.clone())
            .or_insert(client);
        Ok(())
    }

    async fn read_client(&self, client_id: &ClientId) -> Result<ClientRecord, StoreError> {
        self.clients
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| StoreError::ClientNotFound(client_id.clone()))
    }

    async fn create_flow(&self, record: FlowRecord) -> Result<(), StoreError> {
        if !self.clients.read().contains_key(record.client_id()) {
            return Err(StoreError::ClientNotFound(record.client_id().clone()));
        }

        let mut flows = self.flows.write();
        if flows.contains_key(&record.key) {
            return Err(StoreError::AlreadyExists(record.key.clone()));
        }
        flows.insert(
            record.key.clone(),
            FlowEntry {
                record,
                requests: BTreeMap::new(),
                results: vec![],
                logs: vec![],
                plugins: vec![],
            },
        );
        Ok(())
    }

    async fn read_flow(&self, key: &FlowKey) -> Result<FlowRecord, StoreError> {
        self.with_flow(key, |entry| Ok(entry.record.clone()))
    }

    async fn update_flow(&self, mut record: FlowRecord) -> Result<u64, StoreError> {
        let key = record.key.clone();
        self.with_flow_mut(&key, |entry| {
            if entry.record.version != record.version {
                return Err(StoreError::ConcurrencyConflict {
                    key: key.clone(),
                    expected: record.version,
                    actual: entry.record.version,
                });
            }
            record.version += 1;
            let version = record.version;
            entry.record = record;
            Ok(version)
        })
    }

    async fn list_flows(
        &self,
        client_id: &ClientId,
        filter: &FlowFilter,
        page: Pagination,
    ) -> Result<Vec<FlowRecord>, StoreError> {
        if !self.clients.read().contains_key(client_id) {
            return Err(StoreError::ClientNotFound(client_id.clone()));
        }

        let flows = self.flows.read();
        let mut records: Vec<FlowRecord> = flows
            .values()
            .map(|e| &e.record)
            .filter(|r| r.client_id() == client_id && filter.matches(r))
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.flow_id().cmp(a.flow_id()))
        });
        Ok(page.apply(records))
    }

    async fn write_requests(
        &self,
        key: &FlowKey,
        requests: Vec<FlowRequest>,
    ) -> Result<(), StoreError> {
        self.with_flow_mut(key, |entry| {
            for request in requests {
                entry.requests.insert(request.request_id, request);
            }
            Ok(())
        })
    }

    async fn read_request(
        &self,
        key: &FlowKey,
        request_id: RequestId,
    ) -> Result<FlowRequest, StoreError> {
        self.with_flow(key, |entry| {
            entry
                .requests
                .get(&request_id)
                .cloned()
                .ok_or_else(|| StoreError::RequestNotFound {
                    key: key.clone(),
                    request_id,
                })
        })
    }

    async fn resolve_request(
        &self,
        key: &FlowKey,
        request_id: RequestId,
        state: RequestState,
        response: Option<ClientResponse>,
    ) -> Result<Option<FlowRequest>, StoreError> {
        self.with_flow_mut(key, |entry| {
            let request =
                entry
                    .requests
                    .get_mut(&request_id)
                    .ok_or_else(|| StoreError::RequestNotFound {
                        key: key.clone(),
                        request_id,
                    })?;

            if !request.state.is_outstanding() {
                return Ok(None);
            }
            request.state = state;
            request.response = response;
            Ok(Some(request.clone()))
        })
    }

    async fn record_attempt(
        &self,
        key: &FlowKey,
        request_id: RequestId,
    ) -> Result<u32, StoreError> {
        self.with_flow_mut(key, |entry| {
            let request =
                entry
                    .requests
                    .get_mut(&request_id)
                    .ok_or_else(|| StoreError::RequestNotFound {
                        key: key.clone(),
                        request_id,
                    })?;
            request.attempts += 1;
            Ok(request.attempts)
        })
    }

    async fn abandon_requests(&self, key: &FlowKey) -> Result<Vec<RequestId>, StoreError> {
        self.with_flow_mut(key, |entry| {
            let mut abandoned = vec![];
            for request in entry.requests.values_mut() {
                if request.state.is_outstanding() {
                    request.state = RequestState::Abandoned;
                    abandoned.push(request.request_id);
                }
            }
            Ok(abandoned)
        })
    }

    async fn list_requests(
        &self,
        key: &FlowKey,
        page: Pagination,
    ) -> Result<Vec<FlowRequest>, StoreError> {
        self.with_flow(key, |entry| Ok(page.apply(entry.requests.values().cloned())))
    }

    async fn count_pending_requests(&self, key: &FlowKey) -> Result<usize, StoreError> {
        self.with_flow(key, |entry| {
            Ok(entry
                .requests
                .values()
                .filter(|r| r.state.is_outstanding())
                .count())
        })
    }

    async fn write_results(
        &self,
        key: &FlowKey,
        results: Vec<FlowResult>,
    ) -> Result<Vec<FlowResult>, StoreError> {
        self.with_flow_mut(key, |entry| {
            let mut written = Vec::with_capacity(results.len());
            for mut result in results {
                result.index = entry.results.len() as u64;
                entry.results.push(result.clone());
                written.push(result);
            }
            Ok(written)
        })
    }

    async fn read_results(&self, key: &FlowKey) -> Result<Vec<FlowResult>, StoreError> {
        self.with_flow(key, |entry| Ok(entry.results.clone()))
    }

    async fn count_results(&self, key: &FlowKey) -> Result<u64, StoreError> {
        self.with_flow(key, |entry| Ok(entry.results.len() as u64))
    }

    async fn append_log(&self, mut entry: FlowLogEntry) -> Result<(), StoreError> {
        let key = FlowKey::new(entry.client_id.clone(), entry.flow_id.clone());
        entry.sequence = self.log_sequence.fetch_add(1, Ordering::SeqCst);
        self.with_flow_mut(&key, |flow| {
            flow.logs.push(entry);
            Ok(())
        })
    }

    async fn read_logs(&self, key: &FlowKey) -> Result<Vec<FlowLogEntry>, StoreError> {
        self.with_flow(key, |entry| {
            let mut logs = entry.logs.clone();
            logs.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.sequence.cmp(&b.sequence))
            });
            Ok(logs)
        })
    }

    async fn write_plugin_state(
        &self,
        key: &FlowKey,
        state: OutputPluginState,
    ) -> Result<(), StoreError> {
        self.with_flow_mut(key, |entry| {
            match entry
                .plugins
                .iter_mut()
                .find(|p| p.state.plugin_id == state.plugin_id)
            {
                Some(existing) => existing.state = state,
                None => entry.plugins.push(PluginEntry {
                    state,
                    logs: vec![],
                    errors: vec![],
                }),
            }
            Ok(())
        })
    }

    async fn read_plugin_states(
        &self,
        key: &FlowKey,
    ) -> Result<Vec<OutputPluginState>, StoreError> {
        self.with_flow(key, |entry| {
            Ok(entry.plugins.iter().map(|p| p.state.clone()).collect())
        })
    }

    async fn record_plugin_batch(
        &self,
        key: &FlowKey,
        plugin_id: &str,
        batch: PluginBatchRecord,
    ) -> Result<(), StoreError> {
        self.with_flow_mut(key, |entry| {
            let plugin = entry.plugin_mut(key, plugin_id)?;
            plugin.state.applied_count += batch.applied;
            plugin.state.log_count += batch.logs.len() as u64;
            plugin.state.error_count += batch.errors.len() as u64;
            if let Some(state) = batch.state {
                plugin.state.state = state;
            }
            plugin.logs.extend(batch.logs);
            plugin.errors.extend(batch.errors);
            Ok(())
        })
    }

    async fn read_plugin_logs(
        &self,
        key: &FlowKey,
        plugin_id: &str,
    ) -> Result<Vec<OutputPluginLogEntry>, StoreError> {
        self.with_flow(key, |entry| Ok(entry.plugin(key, plugin_id)?.logs.clone()))
    }

    async fn read_plugin_errors(
        &self,
        key: &FlowKey,
        plugin_id: &str,
    ) -> Result<Vec<OutputPluginLogEntry>, StoreError> {
        self.with_flow(key, |entry| Ok(entry.plugin(key, plugin_id)?.errors.clone()))
    }

    async fn write_notification(&self, notification: UserNotification) -> Result<(), StoreError> {
        self.notifications.write().push(notification);
        Ok(())
    }

    async fn read_notifications(
        &self,
        username: &str,
    ) -> Result<Vec<UserNotification>, StoreError> {
        Ok(self
            .notifications
            .read()
            .iter()
            .filter(|n| n.username == username)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowId, RequestTarget, RunnerArgs};
    use crate::output::OutputPluginDescriptor;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn key() -> FlowKey {
        FlowKey::new(ClientId::from_index(0), FlowId::new("ABCDEF12").unwrap())
    }

    async fn store_with_flow() -> InMemoryFlowStore {
        let store = InMemoryFlowStore::new();
        store
            .write_client(ClientRecord::new(ClientId::from_index(0)))
            .await
            .unwrap();
        store
            .create_flow(FlowRecord::new(
                key(),
                "ListProcesses",
                json!({}),
                RunnerArgs::default(),
                "test",
            ))
            .await
            .unwrap();
        store
    }

    fn request(id: RequestId) -> FlowRequest {
        FlowRequest::new(
            id,
            RequestTarget::ClientAction {
                action: "ListProcesses".to_string(),
            },
            json!({}),
            "IterateProcesses",
        )
    }

    #[tokio::test]
    async fn test_create_requires_known_client() {
        let store = InMemoryFlowStore::new();
        let err = store
            .create_flow(FlowRecord::new(
                key(),
                "ListProcesses",
                json!({}),
                RunnerArgs::default(),
                "test",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClientNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_key() {
        let store = store_with_flow().await;
        let err = store
            .create_flow(FlowRecord::new(
                key(),
                "GetFile",
                json!({}),
                RunnerArgs::default(),
                "test",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_optimistic_concurrency() {
        let store = store_with_flow().await;
        let record = store.read_flow(&key()).await.unwrap();

        let version = store.update_flow(record.clone()).await.unwrap();
        assert_eq!(version, 1);

        // Stale copy is rejected
        let result = store.update_flow(record).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_resolve_request_once() {
        let store = store_with_flow().await;
        store.write_requests(&key(), vec![request(1)]).await.unwrap();

        let first = store
            .resolve_request(
                &key(),
                1,
                RequestState::Answered,
                Some(ClientResponse::ok(vec![])),
            )
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .resolve_request(
                &key(),
                1,
                RequestState::Answered,
                Some(ClientResponse::ok(vec![])),
            )
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.count_pending_requests(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandon_only_pending() {
        let store = store_with_flow().await;
        store
            .write_requests(&key(), vec![request(1), request(2)])
            .await
            .unwrap();
        store
            .resolve_request(&key(), 1, RequestState::Answered, None)
            .await
            .unwrap();

        let abandoned = store.abandon_requests(&key()).await.unwrap();
        assert_eq!(abandoned, vec![2]);

        let requests = store.list_requests(&key(), Pagination::all()).await.unwrap();
        assert_eq!(requests[0].state, RequestState::Answered);
        assert_eq!(requests[1].state, RequestState::Abandoned);
    }

    #[tokio::test]
    async fn test_result_indices_are_dense() {
        let store = store_with_flow().await;
        let result = |payload| FlowResult {
            client_id: ClientId::from_index(0),
            flow_id: FlowId::new("ABCDEF12").unwrap(),
            request_id: 1,
            index: 99,
            payload_type: "Process".to_string(),
            payload,
            timestamp: Utc::now(),
        };

        store
            .write_results(&key(), vec![result(json!(1)), result(json!(2))])
            .await
            .unwrap();
        let written = store.write_results(&key(), vec![result(json!(3))]).await.unwrap();

        assert_eq!(written[0].index, 2);
        let indices: Vec<u64> = store
            .read_results(&key())
            .await
            .unwrap()
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_logs_ordered_by_timestamp() {
        let store = store_with_flow().await;
        let now = Utc::now();

        store
            .append_log(FlowLogEntry::new(&key(), "second").at(now))
            .await
            .unwrap();
        store
            .append_log(FlowLogEntry::new(&key(), "first").at(now - Duration::seconds(1)))
            .await
            .unwrap();
        store
            .append_log(FlowLogEntry::new(&key(), "third").at(now))
            .await
            .unwrap();

        let messages: Vec<String> = store
            .read_logs(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_plugin_batches_accumulate() {
        let store = store_with_flow().await;
        store
            .write_plugin_state(
                &key(),
                OutputPluginState::new("DummyOutputPlugin_0", OutputPluginDescriptor::new("DummyOutputPlugin")),
            )
            .await
            .unwrap();

        for _ in 0..2 {
            store
                .record_plugin_batch(
                    &key(),
                    "DummyOutputPlugin_0",
                    PluginBatchRecord {
                        applied: 3,
                        state: Some(json!({"n": 1})),
                        logs: vec![OutputPluginLogEntry::new(&key(), "DummyOutputPlugin_0", 0, "ok")],
                        errors: vec![],
                    },
                )
                .await
                .unwrap();
        }

        let states = store.read_plugin_states(&key()).await.unwrap();
        assert_eq!(states[0].applied_count, 6);
        assert_eq!(states[0].log_count, 2);
        assert_eq!(
            store
                .read_plugin_logs(&key(), "DummyOutputPlugin_0")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_not_found() {
        let store = store_with_flow().await;
        let err = store
            .read_plugin_errors(&key(), "EmailOutputPlugin_0")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PluginNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_flows_unknown_client() {
        let store = InMemoryFlowStore::new();
        let err = store
            .list_flows(&ClientId::from_index(7), &FlowFilter::default(), Pagination::all())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
