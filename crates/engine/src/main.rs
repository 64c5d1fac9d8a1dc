//! Demo binary: runs a few built-in flows against a simulated client

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetflow_engine::prelude::*;
use fleetflow_engine::telemetry::{init_tracing, TelemetryConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Answers client actions the way a healthy agent would
async fn simulated_client(
    mut inbox: mpsc::UnboundedReceiver<ClientMessage>,
    dispatcher: ClientActionDispatcher,
) {
    while let Some(message) = inbox.recv().await {
        let response = match message.action.as_str() {
            "ListProcesses" => ClientResponse::ok(vec![
                json!({"pid": 1, "name": "init", "exe": "/sbin/init"}),
                json!({"pid": 412, "ppid": 1, "name": "sshd", "exe": "/usr/sbin/sshd"}),
                json!({"pid": 977, "ppid": 412, "name": "bash", "exe": "/bin/bash"}),
            ]),
            "GetPlatformInfo" => ClientResponse::ok(vec![
                json!({"system": "Linux", "release": "6.1", "machine": "x86_64"}),
            ]),
            "GetClientInfo" => {
                ClientResponse::ok(vec![json!({"client_name": "fleetflow-demo-agent"})])
            }
            "EnumerateInterfaces" => ClientResponse::ok(vec![
                json!({"ifname": "lo", "addresses": ["127.0.0.1"]}),
                json!({"ifname": "eth0", "addresses": ["10.0.0.7"]}),
            ]),
            "StatFile" => {
                let path = message.payload.get("path").cloned().unwrap_or(Value::Null);
                ClientResponse::ok(vec![json!({"path": path, "st_size": 1024})])
            }
            "TransferBuffer" => ClientResponse::ok(vec![]),
            other => ClientResponse::error(format!("unsupported action: {other}")),
        };

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

async fn wait_for_completion<S: FlowStore>(
    lifecycle: &FlowLifecycle<S>,
    client_id: &str,
    flow_id: &str,
) -> Result<FlowRecord> {
    loop {
        let record = lifecycle.get_flow(client_id, flow_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run_demo(lifecycle: &FlowLifecycle<InMemoryFlowStore>, client_id: &str) -> Result<()> {
    let principal = Principal::new("demo");

    for descriptor in lifecycle.list_flow_descriptors() {
        tracing::info!(name = %descriptor.name, category = %descriptor.category, "flow available");
    }

    let runner_args = RunnerArgs::default()
        .with_output_plugin(OutputPluginDescriptor::new("DummyOutputPlugin"))
        .with_output_plugin(
            OutputPluginDescriptor::new("EmailOutputPlugin")
                .with_args(json!({"email_address": "demo@example.com", "emails_limit": 2})),
        )
        .with_notification();

    let processes = lifecycle
        .create_flow(
            &principal,
            client_id,
            "ListProcesses",
            json!({"filename_regex": "sh", "fetch_binaries": true}),
            runner_args,
        )
        .await
        .context("failed to create ListProcesses flow")?;
    let interrogate = lifecycle
        .create_flow(
            &principal,
            client_id,
            "Interrogate",
            Value::Null,
            RunnerArgs::default(),
        )
        .await
        .context("failed to create Interrogate flow")?;

    for flow_id in [&processes.key.flow_id, &interrogate.key.flow_id] {
        let flow_id = flow_id.as_str();
        let record = wait_for_completion(lifecycle, client_id, flow_id).await?;
        let results = lifecycle
            .list_flow_results(client_id, flow_id, &ResultFilter::default())
            .await?;
        tracing::info!(
            flow_id,
            flow_type = %record.flow_type,
            status = %record.status,
            results = results.total_count,
            "flow finished"
        );
        for result in results.items {
            tracing::info!(flow_id, payload_type = %result.payload_type, payload = %result.payload, "result");
        }
    }

    lifecycle.runner().flush_outputs().await;
    let processes_id = processes.key.flow_id.as_str();
    for plugin in lifecycle
        .list_flow_output_plugins(client_id, processes_id)
        .await?
    {
        tracing::info!(
            plugin_id = %plugin.plugin_id,
            applied = plugin.applied_count,
            logs = plugin.log_count,
            errors = plugin.error_count,
            "output plugin"
        );
    }

    for notification in lifecycle.list_notifications(&principal).await? {
        tracing::info!(message = %notification.message, "notification");
    }

    let command = lifecycle
        .get_flow_results_export_command(client_id, processes_id)
        .await?;
    tracing::info!(%command, "export command");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(TelemetryConfig::from_env()).context("failed to install tracing subscriber")?;
    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    tracing::info!("fleetflow demo starting...");

    let store = Arc::new(InMemoryFlowStore::new());
    let client_id = ClientId::from_index(0);
    store
        .write_client(ClientRecord::new(client_id.clone()))
        .await
        .context("failed to register demo client")?;

    let transport = Arc::new(ChannelTransport::new());
    let inbox = transport.connect(client_id.clone());
    let lifecycle = FlowLifecycle::build(store, transport, &config);

    tokio::spawn(simulated_client(
        inbox,
        lifecycle.runner().dispatcher().clone(),
    ));

    tokio::select! {
        result = run_demo(&lifecycle, client_id.as_str()) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    tracing::info!("fleetflow demo complete");
    Ok(())
}
