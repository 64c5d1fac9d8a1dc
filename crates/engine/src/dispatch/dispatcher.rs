//! Client action dispatcher
//!
//! Routes outgoing requests to clients and incoming responses back to the
//! flow runner. Each client has its own FIFO queue drained by a dedicated
//! delivery task, so one slow client never holds up another.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::transport::{ClientMessage, ClientTransport, TransportError};
use crate::flow::{
    ClientId, ClientResponse, FlowId, FlowKey, FlowRequest, RequestId, RequestState,
    RequestTarget,
};
use crate::reliability::{option_duration_millis, RetryPolicy};

/// Receiver of responses routed by the dispatcher
#[async_trait]
pub trait ResponseHandler: Send + Sync + 'static {
    /// A request was answered (`Answered`) or its deadline passed (`TimedOut`)
    async fn handle_response(
        &self,
        key: FlowKey,
        request_id: RequestId,
        response: ClientResponse,
        outcome: RequestState,
    );

    /// A delivery attempt is about to be made
    async fn delivery_attempted(&self, key: &FlowKey, request_id: RequestId) {
        let _ = (key, request_id);
    }
}

/// Dispatcher errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Only client actions travel through the dispatcher
    #[error("request {0} is not a client action")]
    NotClientAction(RequestId),

    /// Flow was cancelled; nothing more is sent for it
    #[error("flow {0} is cancelled")]
    FlowCancelled(FlowKey),

    /// Delivery failed for good (surfaced as a synthesized failure response)
    #[error("delivery failed: {0}")]
    Transport(#[from] TransportError),
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Redelivery schedule for unreachable clients
    pub retry: RetryPolicy,

    /// How long a delivered request may wait for its response
    #[serde(default, with = "option_duration_millis")]
    pub response_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(),
            response_timeout: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }
}

/// A request queued for delivery
#[derive(Debug, Clone)]
struct Delivery {
    key: FlowKey,
    message: ClientMessage,
    token: CancellationToken,
}

struct DispatcherInner {
    transport: Arc<dyn ClientTransport>,
    config: DispatcherConfig,
    handler: RwLock<Option<Weak<dyn ResponseHandler>>>,
    queues: DashMap<ClientId, mpsc::UnboundedSender<Delivery>>,
    flow_tokens: DashMap<FlowKey, CancellationToken>,
    deadlines: DashMap<(FlowKey, RequestId), CancellationToken>,
}

impl DispatcherInner {
    fn handler(&self) -> Option<Arc<dyn ResponseHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    async fn deliver_response(
        &self,
        key: FlowKey,
        request_id: RequestId,
        response: ClientResponse,
        outcome: RequestState,
    ) {
        match self.handler() {
            Some(handler) => {
                handler
                    .handle_response(key, request_id, response, outcome)
                    .await
            }
            None => warn!(%key, request_id, "no response handler attached, response dropped"),
        }
    }

    /// Make delivery attempt `attempt` (1-based)
    ///
    /// Boxed because a failed attempt schedules the next one.
    fn attempt(self: Arc<Self>, delivery: Delivery, attempt: u32) -> BoxFuture<'static, ()> {
        async move {
            let key = delivery.key.clone();
            let request_id = delivery.message.request_id;

            if delivery.token.is_cancelled() {
                debug!(%key, request_id, "flow cancelled, delivery skipped");
                return;
            }

            if let Some(handler) = self.handler() {
                handler.delivery_attempted(&key, request_id).await;
            }

            match self.transport.deliver(delivery.message.clone()).await {
                Ok(()) => {
                    debug!(%key, request_id, attempt, "request delivered");
                    self.arm_deadline(&delivery);
                }
                Err(e) if e.is_transient() && self.config.retry.has_attempts_remaining(attempt) => {
                    let delay = self.config.retry.delay_for_attempt(attempt + 1);
                    debug!(%key, request_id, attempt, ?delay, error = %e, "delivery failed, retrying");

                    let token = delivery.token.clone();
                    let inner = self.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!(%key, request_id, "retry cancelled");
                            }
                            _ = tokio::time::sleep(delay) => {
                                inner.attempt(delivery, attempt + 1).await;
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(%key, request_id, attempt, error = %e, "delivery failed, giving up");
                    let response = ClientResponse::error(format!(
                        "delivery failed after {attempt} attempts: {e}"
                    ));
                    // Off the client queue, so later requests keep flowing
                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner
                            .deliver_response(key, request_id, response, RequestState::Answered)
                            .await;
                    });
                }
            }
        }
        .boxed()
    }

    /// Start the response deadline timer for a delivered request
    fn arm_deadline(self: &Arc<Self>, delivery: &Delivery) {
        let Some(timeout) = self.config.response_timeout else {
            return;
        };

        let key = delivery.key.clone();
        let request_id = delivery.message.request_id;
        let token = delivery.token.child_token();
        self.deadlines
            .insert((key.clone(), request_id), token.clone());

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    inner.deadlines.remove(&(key.clone(), request_id));
                    debug!(%key, request_id, ?timeout, "response deadline passed");
                    let response = ClientResponse::error(format!(
                        "no response within {} ms",
                        timeout.as_millis()
                    ));
                    inner
                        .deliver_response(key, request_id, response, RequestState::TimedOut)
                        .await;
                }
            }
        });
    }

    fn queue_for(self: &Arc<Self>, client_id: &ClientId) -> mpsc::UnboundedSender<Delivery> {
        if let Some(queue) = self.queues.get(client_id) {
            if !queue.is_closed() {
                return queue.clone();
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        self.queues.insert(client_id.clone(), tx.clone());

        let inner = self.clone();
        let client_id = client_id.clone();
        tokio::spawn(async move {
            debug!(%client_id, "client delivery queue started");
            while let Some(delivery) = rx.recv().await {
                inner.clone().attempt(delivery, 1).await;
            }
            debug!(%client_id, "client delivery queue stopped");
        });

        tx
    }
}

/// Routes requests to clients and responses back to flows
///
/// Delivery is at-least-once. Transient failures are retried with the
/// configured [`RetryPolicy`]; when retries run out (or a permanent error
/// occurs) a failure response is synthesized so the flow can react.
#[derive(Clone)]
pub struct ClientActionDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ClientActionDispatcher {
    pub fn new(transport: Arc<dyn ClientTransport>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                config,
                handler: RwLock::new(None),
                queues: DashMap::new(),
                flow_tokens: DashMap::new(),
                deadlines: DashMap::new(),
            }),
        }
    }

    /// Attach the receiver of routed responses
    pub fn set_handler(&self, handler: Weak<dyn ResponseHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Queue a client request (fire-and-forget)
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, request), fields(request_id = request.request_id))]
    pub fn send(&self, key: &FlowKey, request: &FlowRequest) -> Result<(), DispatchError> {
        let RequestTarget::ClientAction { action } = &request.target else {
            return Err(DispatchError::NotClientAction(request.request_id));
        };

        let token = self
            .inner
            .flow_tokens
            .entry(key.clone())
            .or_default()
            .clone();
        if token.is_cancelled() {
            return Err(DispatchError::FlowCancelled(key.clone()));
        }

        let delivery = Delivery {
            key: key.clone(),
            message: ClientMessage {
                client_id: key.client_id.clone(),
                flow_id: key.flow_id.clone(),
                request_id: request.request_id,
                action: action.clone(),
                payload: request.payload.clone(),
            },
            token,
        };

        let queue = self.inner.queue_for(&key.client_id);
        if let Err(mpsc::error::SendError(delivery)) = queue.send(delivery) {
            // Queue worker went away between lookup and send; start a new one.
            self.inner.queues.remove(&key.client_id);
            let _ = self.inner.queue_for(&key.client_id).send(delivery);
        }
        debug!(action = %action, "request queued");
        Ok(())
    }

    /// Route a client's response to its flow
    #[instrument(skip(self, response))]
    pub async fn on_response(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        request_id: RequestId,
        response: ClientResponse,
    ) {
        let key = FlowKey::new(client_id, flow_id);
        if let Some((_, deadline)) = self.inner.deadlines.remove(&(key.clone(), request_id)) {
            deadline.cancel();
        }
        self.inner
            .deliver_response(key, request_id, response, RequestState::Answered)
            .await;
    }

    /// Cancel every retry and deadline timer of a flow
    pub fn cancel_flow(&self, key: &FlowKey) {
        let token = self
            .inner
            .flow_tokens
            .entry(key.clone())
            .or_default()
            .clone();
        token.cancel();
        self.inner.deadlines.retain(|(k, _), _| k != key);
        debug!(%key, "flow timers cancelled");
    }

    /// Forget a finished flow's cancellation state
    pub fn release_flow(&self, key: &FlowKey) {
        if let Some((_, token)) = self.inner.flow_tokens.remove(key) {
            token.cancel();
        }
        self.inner.deadlines.retain(|(k, _), _| k != key);
    }

    /// Number of clients with a delivery queue
    pub fn client_queue_count(&self) -> usize {
        self.inner.queues.len()
    }
}

impl std::fmt::Debug for ClientActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientActionDispatcher")
            .field("config", &self.inner.config)
            .field("client_queues", &self.inner.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChannelTransport;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingHandler {
        responses: Mutex<Vec<(FlowKey, RequestId, ClientResponse, RequestState)>>,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ResponseHandler for RecordingHandler {
        async fn handle_response(
            &self,
            key: FlowKey,
            request_id: RequestId,
            response: ClientResponse,
            outcome: RequestState,
        ) {
            self.responses
                .lock()
                .push((key, request_id, response, outcome));
        }

        async fn delivery_attempted(&self, _key: &FlowKey, _request_id: RequestId) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails with `Unreachable` a fixed number of times, then succeeds
    struct FlakyTransport {
        failures_left: AtomicU32,
        delivered: Mutex<Vec<ClientMessage>>,
    }

    #[async_trait]
    impl ClientTransport for FlakyTransport {
        async fn deliver(&self, message: ClientMessage) -> Result<(), TransportError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TransportError::Unreachable(message.client_id));
            }
            self.delivered.lock().push(message);
            Ok(())
        }
    }

    fn key(index: u32) -> FlowKey {
        FlowKey::new(ClientId::from_index(index), FlowId::new("ABCDEF12").unwrap())
    }

    fn request(id: RequestId) -> FlowRequest {
        FlowRequest::new(
            id,
            RequestTarget::ClientAction {
                action: "ListProcesses".to_string(),
            },
            json!({"n": id}),
            "IterateProcesses",
        )
    }

    fn fast_retry(max_attempts: u32) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_retry(RetryPolicy::fixed(Duration::from_millis(5), max_attempts))
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_fifo_per_client() {
        let transport = Arc::new(ChannelTransport::new());
        let mut inbox = transport.connect(ClientId::from_index(0));
        let dispatcher = ClientActionDispatcher::new(transport, DispatcherConfig::default());

        for id in 1..=5 {
            dispatcher.send(&key(0), &request(id)).unwrap();
        }

        let mut received = vec![];
        for _ in 0..5 {
            received.push(inbox.recv().await.unwrap().request_id);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_retry_then_deliver() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicU32::new(2),
            delivered: Mutex::new(vec![]),
        });
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = ClientActionDispatcher::new(transport.clone(), fast_retry(5));
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(&handler) as Weak<dyn ResponseHandler>;
        dispatcher.set_handler(weak);

        dispatcher.send(&key(0), &request(1)).unwrap();

        wait_until(|| transport.delivered.lock().len() == 1).await;
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        assert!(handler.responses.lock().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_synthesizes_failure() {
        let transport = Arc::new(ChannelTransport::new());
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = ClientActionDispatcher::new(transport, fast_retry(3));
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(&handler) as Weak<dyn ResponseHandler>;
        dispatcher.set_handler(weak);

        dispatcher.send(&key(0), &request(7)).unwrap();

        wait_until(|| handler.responses.lock().len() == 1).await;
        let responses = handler.responses.lock();
        let (_, request_id, response, outcome) = &responses[0];
        assert_eq!(*request_id, 7);
        assert_eq!(*outcome, RequestState::Answered);
        assert!(response
            .error_message()
            .unwrap()
            .contains("after 3 attempts"));
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    }

    /// Refuses request 1 for good and holds its failure response forever
    struct StuckHandler {
        failed: AtomicU32,
    }

    #[async_trait]
    impl ResponseHandler for StuckHandler {
        async fn handle_response(
            &self,
            _key: FlowKey,
            _request_id: RequestId,
            _response: ClientResponse,
            _outcome: RequestState,
        ) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    struct RejectFirstTransport {
        delivered: Mutex<Vec<RequestId>>,
    }

    #[async_trait]
    impl ClientTransport for RejectFirstTransport {
        async fn deliver(&self, message: ClientMessage) -> Result<(), TransportError> {
            if message.request_id == 1 {
                return Err(TransportError::Rejected {
                    client_id: message.client_id,
                    reason: "unsupported".to_string(),
                });
            }
            self.delivered.lock().push(message.request_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_response_does_not_block_queue() {
        let transport = Arc::new(RejectFirstTransport {
            delivered: Mutex::new(vec![]),
        });
        let handler = Arc::new(StuckHandler {
            failed: AtomicU32::new(0),
        });
        let dispatcher = ClientActionDispatcher::new(transport.clone(), fast_retry(1));
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(&handler) as Weak<dyn ResponseHandler>;
        dispatcher.set_handler(weak);

        for id in 1..=3 {
            dispatcher.send(&key(0), &request(id)).unwrap();
        }

        wait_until(|| transport.delivered.lock().len() == 2).await;
        assert_eq!(*transport.delivered.lock(), vec![2, 3]);
        assert_eq!(handler.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_retries() {
        let transport = Arc::new(ChannelTransport::new());
        let handler = Arc::new(RecordingHandler::default());
        let config = DispatcherConfig::default()
            .with_retry(RetryPolicy::fixed(Duration::from_millis(50), 10));
        let dispatcher = ClientActionDispatcher::new(transport, config);
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(&handler) as Weak<dyn ResponseHandler>;
        dispatcher.set_handler(weak);

        dispatcher.send(&key(0), &request(1)).unwrap();
        wait_until(|| handler.attempts.load(Ordering::SeqCst) >= 1).await;
        dispatcher.cancel_flow(&key(0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
        assert!(handler.responses.lock().is_empty());
        assert_eq!(
            dispatcher.send(&key(0), &request(2)),
            Err(DispatchError::FlowCancelled(key(0)))
        );
    }

    #[tokio::test]
    async fn test_response_deadline_times_out() {
        let transport = Arc::new(ChannelTransport::new());
        let _inbox = transport.connect(ClientId::from_index(0));
        let handler = Arc::new(RecordingHandler::default());
        let config = DispatcherConfig::default().with_response_timeout(Duration::from_millis(20));
        let dispatcher = ClientActionDispatcher::new(transport, config);
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(&handler) as Weak<dyn ResponseHandler>;
        dispatcher.set_handler(weak);

        dispatcher.send(&key(0), &request(1)).unwrap();

        wait_until(|| handler.responses.lock().len() == 1).await;
        assert_eq!(handler.responses.lock()[0].3, RequestState::TimedOut);
    }

    #[tokio::test]
    async fn test_response_disarms_deadline() {
        let transport = Arc::new(ChannelTransport::new());
        let mut inbox = transport.connect(ClientId::from_index(0));
        let handler = Arc::new(RecordingHandler::default());
        let config = DispatcherConfig::default().with_response_timeout(Duration::from_millis(50));
        let dispatcher = ClientActionDispatcher::new(transport, config);
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(&handler) as Weak<dyn ResponseHandler>;
        dispatcher.set_handler(weak);

        dispatcher.send(&key(0), &request(1)).unwrap();
        let message = inbox.recv().await.unwrap();
        // Let the deadline be armed after the delivery returns
        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher
            .on_response(
                message.client_id,
                message.flow_id,
                message.request_id,
                ClientResponse::ok(vec![]),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let responses = handler.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].3, RequestState::Answered);
    }

    #[tokio::test]
    async fn test_child_flow_requests_rejected() {
        let dispatcher = ClientActionDispatcher::new(
            Arc::new(ChannelTransport::new()),
            DispatcherConfig::default(),
        );
        let request = FlowRequest::new(
            3,
            RequestTarget::ChildFlow {
                flow_name: "GetFile".to_string(),
                flow_id: FlowId::new("00000001").unwrap(),
            },
            json!({}),
            "HandleDownloadedFiles",
        );
        assert_eq!(
            dispatcher.send(&key(0), &request),
            Err(DispatchError::NotClientAction(3))
        );
    }

    #[tokio::test]
    async fn test_separate_queue_per_client() {
        let transport = Arc::new(ChannelTransport::new());
        let _a = transport.connect(ClientId::from_index(0));
        let _b = transport.connect(ClientId::from_index(1));
        let dispatcher = ClientActionDispatcher::new(transport, DispatcherConfig::default());

        dispatcher.send(&key(0), &request(1)).unwrap();
        dispatcher.send(&key(1), &request(1)).unwrap();
        dispatcher.send(&key(1), &request(2)).unwrap();

        assert_eq!(dispatcher.client_queue_count(), 2);
    }
}
