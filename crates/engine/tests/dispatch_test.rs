//! Client action delivery: retries, response deadlines and ordering

mod common;

use std::time::Duration;

use common::{next_message, MockClient, TestEngine, CLIENT_ID};
use fleetflow_engine::prelude::*;
use fleetflow_engine::RequestState;
use serde_json::json;

fn config_with_dispatcher(dispatcher: DispatcherConfig) -> EngineConfig {
    EngineConfig {
        dispatcher,
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn test_exhausted_retries_fail_flow() {
    let engine = TestEngine::with_config(config_with_dispatcher(
        DispatcherConfig::default().with_retry(RetryPolicy::fixed(Duration::from_millis(5), 3)),
    ))
    .await;

    // Client never connects
    let flow = engine.create("ListProcesses", json!({})).await;
    let record = engine
        .wait_for_status(&flow.key.flow_id, FlowStatus::Error)
        .await;

    assert!(record
        .error_message
        .unwrap()
        .contains("delivery failed after 3 attempts"));

    let requests = engine
        .lifecycle
        .list_flow_requests(CLIENT_ID, flow.key.flow_id.as_str(), Pagination::all())
        .await
        .unwrap();
    assert_eq!(requests.items[0].attempts, 3);
    assert_eq!(requests.items[0].state, RequestState::Answered);
}

#[test_log::test(tokio::test)]
async fn test_redelivery_after_client_connects() {
    let engine = TestEngine::with_config(config_with_dispatcher(
        DispatcherConfig::default().with_retry(RetryPolicy::fixed(Duration::from_millis(20), 50)),
    ))
    .await;

    let flow = engine.create("ListProcesses", json!({})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut inbox = engine.connect();
    let message = next_message(&mut inbox).await;
    assert_eq!(message.flow_id, flow.key.flow_id);

    let requests = engine
        .lifecycle
        .list_flow_requests(CLIENT_ID, flow.key.flow_id.as_str(), Pagination::all())
        .await
        .unwrap();
    assert!(requests.items[0].attempts > 1);
    assert_eq!(requests.items[0].state, RequestState::Pending);
}

#[test_log::test(tokio::test)]
async fn test_response_deadline_times_out_requests() {
    let engine = TestEngine::with_config(config_with_dispatcher(
        DispatcherConfig::default().with_response_timeout(Duration::from_millis(50)),
    ))
    .await;
    // Connected, but nothing is ever answered
    engine.connect_mock(
        MockClient::new()
            .on("GetPlatformInfo", |_| None)
            .on("GetClientInfo", |_| None),
    );

    let flow = engine
        .create("Interrogate", json!({"lightweight": true}))
        .await;
    let flow_id = flow.key.flow_id.as_str();
    engine
        .wait_for_status(&flow.key.flow_id, FlowStatus::Terminated)
        .await;

    let requests = engine
        .lifecycle
        .list_flow_requests(CLIENT_ID, flow_id, Pagination::all())
        .await
        .unwrap();
    assert_eq!(requests.total_count, 2);
    assert!(requests
        .items
        .iter()
        .all(|r| r.state == RequestState::TimedOut));

    let logs = engine
        .lifecycle
        .list_flow_logs(CLIENT_ID, flow_id, Pagination::all())
        .await
        .unwrap();
    assert!(logs
        .items
        .iter()
        .any(|l| l.message == "Platform failed: no response within 50 ms"));

    // Summary is still produced from whatever arrived
    let results = engine
        .lifecycle
        .list_flow_results(CLIENT_ID, flow_id, &ResultFilter::default())
        .await
        .unwrap();
    assert_eq!(results.items[0].payload_type, "ClientSummary");
}

#[test_log::test(tokio::test)]
async fn test_late_response_after_timeout_dropped() {
    let engine = TestEngine::with_config(config_with_dispatcher(
        DispatcherConfig::default().with_response_timeout(Duration::from_millis(20)),
    ))
    .await;
    let mut inbox = engine.connect();

    let flow = engine.create("ListProcesses", json!({})).await;
    let message = next_message(&mut inbox).await;
    let record = engine
        .wait_for_status(&flow.key.flow_id, FlowStatus::Error)
        .await;
    assert!(record
        .error_message
        .unwrap()
        .contains("no response within 20 ms"));

    engine
        .dispatcher()
        .on_response(
            message.client_id,
            message.flow_id,
            message.request_id,
            ClientResponse::ok(vec![json!({"pid": 1, "name": "init"})]),
        )
        .await;

    let after = engine
        .lifecycle
        .get_flow(CLIENT_ID, flow.key.flow_id.as_str())
        .await
        .unwrap();
    assert_eq!(after.status, FlowStatus::Error);
    assert_eq!(after.result_count, 0);
}

#[test_log::test(tokio::test)]
async fn test_requests_delivered_in_issue_order() {
    let engine = TestEngine::new().await;
    let mut inbox = engine.connect();

    let mut flow_ids = vec![];
    for _ in 0..3 {
        flow_ids.push(engine.create("ListProcesses", json!({})).await.key.flow_id);
    }
    let interrogate = engine.create("Interrogate", json!({})).await;

    for flow_id in &flow_ids {
        let message = next_message(&mut inbox).await;
        assert_eq!(&message.flow_id, flow_id);
    }

    let mut actions = vec![];
    let mut request_ids = vec![];
    for _ in 0..3 {
        let message = next_message(&mut inbox).await;
        assert_eq!(message.flow_id, interrogate.key.flow_id);
        actions.push(message.action);
        request_ids.push(message.request_id);
    }
    assert_eq!(
        actions,
        vec!["GetPlatformInfo", "GetClientInfo", "EnumerateInterfaces"]
    );
    assert!(request_ids.windows(2).all(|w| w[0] < w[1]));
}
