//! Background output plugin pipeline
//!
//! Results written by the runner are submitted as batches to a single
//! background worker, which runs every plugin instance configured on the
//! flow and records what happened. Plugin failures, including panics, are
//! confined to the instance that caused them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use super::{
    OutputPluginLogEntry, OutputPluginRegistry, OutputPluginState, PluginBatchRecord, PluginError,
};
use crate::flow::{FlowKey, FlowResult};
use crate::persistence::{FlowStore, StoreError};

enum PipelineCommand {
    Apply {
        key: FlowKey,
        results: Vec<FlowResult>,
    },
    Flush(oneshot::Sender<()>),
}

/// Runs plugin instances against result batches
pub struct PluginApplier<S: FlowStore> {
    store: Arc<S>,
    plugins: Arc<OutputPluginRegistry>,
}

impl<S: FlowStore> PluginApplier<S> {
    pub fn new(store: Arc<S>, plugins: Arc<OutputPluginRegistry>) -> Self {
        Self { store, plugins }
    }

    /// Run one plugin instance over a batch
    ///
    /// Never fails: a plugin error or panic becomes exactly one error entry
    /// in the returned record.
    #[instrument(skip(self, state, results), fields(plugin_id = %state.plugin_id, batch = results.len()))]
    pub async fn apply(
        &self,
        key: &FlowKey,
        state: &OutputPluginState,
        results: &[FlowResult],
    ) -> PluginBatchRecord {
        let first_index = results.first().map(|r| r.index).unwrap_or(0);
        let entry = |message: String| {
            OutputPluginLogEntry::new(key, state.plugin_id.clone(), first_index, message)
        };

        let run = async {
            let mut plugin = self.plugins.create(&state.descriptor)?;
            let mut plugin_state = state.state.clone();
            let outcome = plugin.process_results(&mut plugin_state, results).await?;
            Ok::<_, PluginError>((outcome, plugin_state))
        };

        let result = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(PluginError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok((outcome, plugin_state)) => {
                debug!(applied = outcome.applied, "output plugin applied batch");
                PluginBatchRecord {
                    applied: outcome.applied,
                    state: Some(plugin_state),
                    logs: outcome.logs.into_iter().map(entry).collect(),
                    errors: outcome.errors.into_iter().map(entry).collect(),
                }
            }
            Err(error) => {
                warn!(error = %error, "output plugin failed");
                PluginBatchRecord {
                    errors: vec![entry(error.to_string())],
                    ..Default::default()
                }
            }
        }
    }

    /// Run every plugin instance of a flow over a batch and persist the outcome
    pub async fn apply_all(&self, key: &FlowKey, results: &[FlowResult]) -> Result<(), StoreError> {
        let states = self.store.read_plugin_states(key).await?;
        for state in states {
            let record = self.apply(key, &state, results).await;
            self.store
                .record_plugin_batch(key, &state.plugin_id, record)
                .await?;
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to the background pipeline worker
///
/// Cloning is cheap; the worker stops once every handle is dropped.
#[derive(Clone)]
pub struct OutputPipeline {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl OutputPipeline {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn<S: FlowStore>(store: Arc<S>, plugins: Arc<OutputPluginRegistry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let applier = PluginApplier::new(store, plugins);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    PipelineCommand::Apply { key, results } => {
                        if let Err(e) = applier.apply_all(&key, &results).await {
                            warn!(%key, error = %e, "failed to record output plugin batch");
                        }
                    }
                    PipelineCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("output pipeline stopped");
        });

        Self { tx }
    }

    /// Queue a batch of results (never blocks)
    pub fn submit(&self, key: FlowKey, results: Vec<FlowResult>) {
        if results.is_empty() {
            return;
        }
        if self
            .tx
            .send(PipelineCommand::Apply { key, results })
            .is_err()
        {
            warn!("output pipeline is not running, batch dropped");
        }
    }

    /// Wait until every batch queued so far has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PipelineCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl std::fmt::Debug for OutputPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ClientId, ClientRecord, FlowId, FlowRecord, RunnerArgs};
    use crate::output::{OutputPlugin, OutputPluginDescriptor, PluginOutcome};
    use crate::persistence::InMemoryFlowStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};

    struct PanickingPlugin;

    #[async_trait]
    impl OutputPlugin for PanickingPlugin {
        fn name(&self) -> &'static str {
            "PanickingPlugin"
        }

        async fn process_results(
            &mut self,
            _state: &mut Value,
            _results: &[FlowResult],
        ) -> Result<PluginOutcome, PluginError> {
            panic!("sink exploded");
        }
    }

    fn key() -> FlowKey {
        FlowKey::new(ClientId::from_index(0), FlowId::new("ABCDEF12").unwrap())
    }

    fn results(n: u64) -> Vec<FlowResult> {
        (0..n)
            .map(|index| FlowResult {
                client_id: ClientId::from_index(0),
                flow_id: FlowId::new("ABCDEF12").unwrap(),
                request_id: 1,
                index,
                payload_type: "Process".to_string(),
                payload: json!({"pid": index}),
                timestamp: Utc::now(),
            })
            .collect()
    }

    async fn setup(plugin_names: &[&str]) -> Arc<InMemoryFlowStore> {
        let store = Arc::new(InMemoryFlowStore::new());
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
        for name in plugin_names {
            store
                .write_plugin_state(
                    &key(),
                    OutputPluginState::new(format!("{name}_0"), OutputPluginDescriptor::new(*name)),
                )
                .await
                .unwrap();
        }
        store
    }

    fn registry() -> Arc<OutputPluginRegistry> {
        let mut registry = OutputPluginRegistry::with_builtins();
        registry.register_factory(
            "PanickingPlugin",
            Box::new(|_| Ok(Box::new(PanickingPlugin) as Box<dyn OutputPlugin>)),
        );
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_failing_plugin_isolated() {
        let store = setup(&["DummyOutputPlugin", "FailingDummyOutputPlugin"]).await;
        let pipeline = OutputPipeline::spawn(store.clone(), registry());

        pipeline.submit(key(), results(3));
        pipeline.flush().await;

        let states = store.read_plugin_states(&key()).await.unwrap();
        assert_eq!(states[0].applied_count, 3);
        assert_eq!(states[0].error_count, 0);
        assert_eq!(states[1].applied_count, 0);
        assert_eq!(states[1].error_count, 1);
    }

    #[tokio::test]
    async fn test_one_error_per_batch() {
        let store = setup(&["FailingDummyOutputPlugin"]).await;
        let pipeline = OutputPipeline::spawn(store.clone(), registry());

        pipeline.submit(key(), results(5));
        pipeline.submit(key(), results(2));
        pipeline.flush().await;

        let errors = store
            .read_plugin_errors(&key(), "FailingDummyOutputPlugin_0")
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "Oh no!");
    }

    #[tokio::test]
    async fn test_panic_becomes_error_entry() {
        let store = setup(&["PanickingPlugin", "DummyOutputPlugin"]).await;
        let pipeline = OutputPipeline::spawn(store.clone(), registry());

        pipeline.submit(key(), results(1));
        pipeline.flush().await;

        let errors = store
            .read_plugin_errors(&key(), "PanickingPlugin_0")
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("sink exploded"));

        let states = store.read_plugin_states(&key()).await.unwrap();
        assert_eq!(states[1].applied_count, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_ignored() {
        let store = setup(&["FailingDummyOutputPlugin"]).await;
        let pipeline = OutputPipeline::spawn(store.clone(), registry());

        pipeline.submit(key(), vec![]);
        pipeline.flush().await;

        let states = store.read_plugin_states(&key()).await.unwrap();
        assert_eq!(states[0].error_count, 0);
    }
}
