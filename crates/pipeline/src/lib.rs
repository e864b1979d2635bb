//! The asynchronous execution pipeline: durable enqueue, worker loop,
//! idempotency, retries, dead-lettering, and status/replay projections.
//!
//! Topology: one durable queue per capability bound to the capability
//! exchange by routing key, a fanout log exchange drained into the
//! persistence event log, and a per-capability dead-letter queue. Workers
//! execute the pinned node through the registry and report results back
//! through the same `WorkerResult` shape the HTTP callback surface uses.

mod broker;
mod control;
mod worker;

pub use broker::{Broker, EX_CAPABILITY, EX_DLQ, EX_LOG, ExchangeKind, MessageQueue};
pub use control::{
    ControlStore, EventEntry, PipelineState, StatusEntry, idempotency_key, node_response_key,
    side_effect_key,
};
pub use worker::{AsyncEnvelope, CapabilityWorker, ResultSink, WorkExecutor, WorkerResult};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use patchbay_core::{
    CapabilityNode, ErrorCode, Message, PROTOCOL_VERSION, ensure_trace, looks_like_protocol,
    make_error, make_error_with, validate_core,
};
use patchbay_persistence::Persistence;
use patchbay_registry::{NodeRegistry, sort_candidates};

/// 202-style acceptance reply for an async enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncAck {
    pub accepted: bool,
    pub message_id: String,
    pub correlation_id: String,
    pub status_url: String,
    pub replay_url: String,
}

/// Full replay projection for one message id.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayView {
    pub message_id: String,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub state: PipelineState,
    pub events: Vec<EventEntry>,
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub node_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            node_timeout: Duration::from_secs(30),
        }
    }
}

/// Executes deliveries by invoking the pinned node through the registry.
struct NodeExecutor {
    registry: Arc<NodeRegistry>,
    http: reqwest::Client,
    node_timeout: Duration,
}

#[async_trait]
impl WorkExecutor for NodeExecutor {
    async fn execute(&self, node_id: &str, message: &Message) -> Message {
        let Some(record) = self.registry.get_record(node_id) else {
            return make_error_with(
                ErrorCode::NodeUnavailable,
                "Assigned node is not registered",
                Some(&message.message_id),
                true,
                json!({"node_id": node_id}),
            );
        };

        let mut outbound = message.clone();
        ensure_trace(&mut outbound, Some(&message.message_id), Some("pipeline.worker"));

        if let Some(node) = &record.handler {
            return node.handle(outbound).await;
        }

        let endpoint = record.descriptor.endpoint_url.clone();
        if !endpoint.starts_with("http") {
            return make_error_with(
                ErrorCode::NodeUnavailable,
                "Assigned node has no reachable handler",
                Some(&message.message_id),
                true,
                json!({"node_id": node_id}),
            );
        }

        let sent = self
            .http
            .post(&endpoint)
            .timeout(self.node_timeout)
            .json(&outbound)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return make_error_with(
                    ErrorCode::NodeTimeout,
                    "Node request timed out. You can retry.",
                    Some(&message.message_id),
                    true,
                    json!({"node_id": node_id}),
                );
            }
            Err(e) => {
                return make_error_with(
                    ErrorCode::NodeUnavailable,
                    &format!("Node request failed: {e}"),
                    Some(&message.message_id),
                    true,
                    json!({"node_id": node_id}),
                );
            }
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return make_error_with(
                    ErrorCode::NodeError,
                    &format!("Node returned unreadable response: {e}"),
                    Some(&message.message_id),
                    false,
                    json!({"node_id": node_id}),
                );
            }
        };
        match validate_core(&body) {
            Ok(message) => message,
            Err(_) => make_error_with(
                ErrorCode::NodeError,
                "Node returned invalid protocol response",
                Some(&message.message_id),
                false,
                json!({"node_id": node_id}),
            ),
        }
    }
}

/// Applies worker results back into the pipeline's control plane.
struct PipelineSink {
    pipeline: Weak<AsyncPipeline>,
}

#[async_trait]
impl ResultSink for PipelineSink {
    async fn post(&self, result: WorkerResult) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.apply_worker_result(result);
        }
    }
}

/// The pipeline façade: enqueue, worker management, result application,
/// and the status/replay projections.
pub struct AsyncPipeline {
    broker: Arc<Broker>,
    control: Arc<ControlStore>,
    registry: Arc<NodeRegistry>,
    persistence: Arc<Persistence>,
    options: PipelineOptions,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    log_drain: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncPipeline {
    pub fn new(
        registry: Arc<NodeRegistry>,
        persistence: Arc<Persistence>,
        options: PipelineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::new(Broker::new()),
            control: Arc::new(ControlStore::new()),
            registry,
            persistence,
            options,
            workers: Mutex::new(HashMap::new()),
            log_drain: Mutex::new(None),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn control(&self) -> &Arc<ControlStore> {
        &self.control
    }

    fn queue_name(capability: &str) -> String {
        format!("bdp.q.{capability}")
    }

    fn dlq_name(capability: &str) -> String {
        format!("bdp.dlq.q.{capability}")
    }

    /// Declare the queue pair for a capability and spawn its worker loop.
    /// Idempotent per capability.
    pub fn ensure_worker(self: &Arc<Self>, capability: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.contains_key(capability) {
            return;
        }

        let queue_name = Self::queue_name(capability);
        let queue = self.broker.declare_queue(&queue_name);
        self.broker.bind(EX_CAPABILITY, capability, &queue_name);

        let dlq_name = Self::dlq_name(capability);
        self.broker.declare_queue(&dlq_name);
        self.broker.bind(EX_DLQ, capability, &dlq_name);

        let required_extensions = self
            .registry
            .capability_metadata(capability)
            .map(|cap| cap.required_extensions)
            .unwrap_or_default();

        let worker = Arc::new(CapabilityWorker {
            queue,
            broker: self.broker.clone(),
            control: self.control.clone(),
            executor: Arc::new(NodeExecutor {
                registry: self.registry.clone(),
                http: reqwest::Client::new(),
                node_timeout: self.options.node_timeout,
            }),
            sink: Arc::new(PipelineSink {
                pipeline: Arc::downgrade(self),
            }),
            retry_delay: self.options.retry_delay,
            required_extensions,
        });

        debug!(capability = %capability, queue = %queue_name, "Capability worker started");
        workers.insert(capability.to_string(), tokio::spawn(worker.run()));
    }

    /// Drain the fanout log exchange into the persistence `pipeline`
    /// channel. Called once by the runtime.
    pub fn start_log_drain(self: &Arc<Self>) {
        let mut drain = self.log_drain.lock().unwrap_or_else(|e| e.into_inner());
        if drain.is_some() {
            return;
        }
        let queue = self.broker.declare_queue("bdp.q.log");
        self.broker.bind(EX_LOG, "", "bdp.q.log");
        let persistence = self.persistence.clone();
        *drain = Some(tokio::spawn(async move {
            loop {
                let entry = queue.pop().await;
                if let Err(e) = persistence.append_log("pipeline", &entry) {
                    warn!(error = %e, "Pipeline log drain write failed");
                }
            }
        }));
    }

    /// Validate, select the pinned node, persist the queued status, and
    /// publish the envelope. The returned error is a protocol envelope.
    pub fn route_async(self: &Arc<Self>, value: Value) -> Result<AsyncAck, Box<Message>> {
        let message = validate_core(&value)?;
        let message_id = message.message_id.clone();
        let intent = message.intent.clone();

        if message.protocol_version != PROTOCOL_VERSION {
            return Err(Box::new(make_error(
                ErrorCode::UnsupportedProtocol,
                &format!("Async router supports protocol {PROTOCOL_VERSION}"),
                Some(&message_id),
            )));
        }

        let mut candidates: Vec<_> = self
            .registry
            .active_records()
            .into_iter()
            .filter(|rec| {
                rec.descriptor
                    .supported_protocol_versions
                    .iter()
                    .any(|v| v == &message.protocol_version)
            })
            .filter(|rec| rec.descriptor.capability(&intent).is_some())
            .collect();
        if candidates.is_empty() {
            return Err(Box::new(make_error_with(
                ErrorCode::NoRoute,
                &format!("No route for intent: {intent}"),
                Some(&message_id),
                false,
                json!({"intent": intent}),
            )));
        }
        sort_candidates(&mut candidates);
        let node_id = candidates[0].descriptor.node_id.clone();

        self.ensure_worker(&intent);

        self.control.set_queued(&message_id, &intent, &node_id, value.clone());
        self.control.append_event(
            &message_id,
            "route_enqueued",
            json!({"node_id": node_id, "routing_key": intent, "attempt": 0}),
        );

        let envelope = AsyncEnvelope {
            message: value,
            node_id: node_id.clone(),
            routing_key: intent.clone(),
            attempt: 0,
            max_attempts: self.options.max_attempts,
        };
        self.broker.publish(
            EX_CAPABILITY,
            &intent,
            serde_json::to_value(envelope).unwrap_or_else(|_| json!({})),
        );
        self.broker.publish(
            EX_LOG,
            "",
            json!({
                "event": "route_enqueued",
                "message_id": message_id,
                "details": {"node_id": node_id, "routing_key": intent},
            }),
        );
        self.persistence.emit_event(
            "router",
            "pipeline.route_enqueued",
            json!({"message_id": message_id, "node_id": node_id, "routing_key": intent}),
        );

        Ok(AsyncAck {
            accepted: true,
            message_id: message_id.clone(),
            correlation_id: message_id.clone(),
            status_url: format!("/status/{message_id}"),
            replay_url: format!("/replay/{message_id}"),
        })
    }

    /// Apply a settled worker result: resolve the terminal state and record
    /// the event. Used by both the in-process sink and `POST
    /// /worker_result`.
    pub fn apply_worker_result(&self, result: WorkerResult) {
        let WorkerResult {
            message_id,
            node_id,
            mut response,
            attempt,
            duplicate,
            dead_lettered,
        } = result;

        if !looks_like_protocol(&response) {
            response = serde_json::to_value(make_error_with(
                ErrorCode::NodeError,
                &format!("Worker returned invalid protocol response: {node_id}"),
                Some(&message_id),
                false,
                json!({"node_id": node_id}),
            ))
            .unwrap_or_else(|_| json!({}));
        }

        let is_error = response.get("intent").and_then(Value::as_str) == Some("error");
        let state = if is_error {
            if dead_lettered {
                PipelineState::Dlq
            } else {
                PipelineState::Error
            }
        } else {
            PipelineState::Completed
        };

        let response_intent = response
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.control.resolve(
            &message_id,
            state,
            &node_id,
            response,
            json!({"attempt": attempt, "duplicate": duplicate, "dead_lettered": dead_lettered}),
        );
        self.control.append_event(
            &message_id,
            "worker_result",
            json!({
                "node_id": node_id,
                "attempt": attempt,
                "duplicate": duplicate,
                "dead_lettered": dead_lettered,
                "response_intent": response_intent,
            }),
        );
        self.persistence.emit_event(
            "router",
            "pipeline.worker_result",
            json!({
                "message_id": message_id,
                "node_id": node_id,
                "state": state.as_str(),
                "attempt": attempt,
                "duplicate": duplicate,
                "dead_lettered": dead_lettered,
            }),
        );
    }

    pub fn status(&self, message_id: &str) -> Option<StatusEntry> {
        self.control.status(message_id)
    }

    pub fn replay(&self, message_id: &str) -> Option<ReplayView> {
        let status = self.control.status(message_id)?;
        Some(ReplayView {
            message_id: message_id.to_string(),
            request: status.request,
            response: status.response,
            state: status.state,
            events: self.control.events(message_id),
        })
    }

    /// Side-effect and duplicate accounting for one message, for
    /// inspection and tests.
    pub fn debug_idempotency(&self, node_id: &str, message_id: &str) -> Value {
        let side_effects = self.control.counter(&side_effect_key(node_id, message_id));
        let duplicates = self
            .control
            .events(message_id)
            .into_iter()
            .filter(|e| e.event == "duplicate_delivery")
            .count();
        json!({
            "message_id": message_id,
            "side_effect_count": side_effects,
            "duplicate_event_count": duplicates,
        })
    }

    /// Drain accumulated dead letters for a capability.
    pub fn dead_letters(&self, capability: &str) -> Vec<Value> {
        let Some(queue) = self.broker.queue(&Self::dlq_name(capability)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(item) = queue.try_pop() {
            out.push(item);
        }
        out
    }

    /// Abort all background tasks.
    pub fn shutdown(&self) {
        for (_, handle) in self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .log_drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for AsyncPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use patchbay_core::{
        CapabilityMetadata, CapabilityNode, Idempotency, RiskClass, SideEffectScope, make_response,
        new_uuid,
    };
    use tempfile::TempDir;

    const TOKEN: &str = "pipeline-test-token";

    struct EchoNode;

    #[async_trait]
    impl CapabilityNode for EchoNode {
        fn node_id(&self) -> &str {
            "terminal.echo"
        }

        fn capabilities(&self) -> Vec<CapabilityMetadata> {
            vec![CapabilityMetadata {
                name: "chat.general".to_string(),
                description: "echo".to_string(),
                input_schema: json!({"type": "object"}),
                risk_class: RiskClass::Read,
                required_extensions: Vec::new(),
                approval_required: false,
                examples: vec!["echo".to_string()],
                idempotency: Idempotency::Idempotent,
                side_effect_scope: SideEffectScope::None,
                capability_version: "0.1.0".to_string(),
                provider: None,
            }]
        }

        async fn handle(&self, message: Message) -> Message {
            let mut payload = message.payload.clone();
            payload.insert("handled_by".to_string(), json!("terminal.echo"));
            make_response("chat.response", payload, Some(&message.message_id))
        }
    }

    fn fixture() -> (TempDir, Arc<AsyncPipeline>) {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(Persistence::new(dir.path()).unwrap());
        let registry = Arc::new(NodeRegistry::new(persistence.clone(), TOKEN, 300.0));
        let node = Arc::new(EchoNode);
        registry.register(node.descriptor(TOKEN), Some(node)).unwrap();
        let pipeline = AsyncPipeline::new(
            registry,
            persistence,
            PipelineOptions {
                max_attempts: 3,
                retry_delay: Duration::from_millis(5),
                node_timeout: Duration::from_secs(3),
            },
        );
        (dir, pipeline)
    }

    fn request(intent: &str, payload: Value) -> Value {
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "message_id": new_uuid(),
            "intent": intent,
            "payload": payload,
            "extensions": {
                "identity": {"actor_id": "user.test", "actor_type": "human", "roles": ["user"]},
            },
        })
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn happy_path_completes_with_events() {
        let (_dir, pipeline) = fixture();
        let value = request("chat.general", json!({"text": "hello"}));
        let ack = pipeline.route_async(value).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.status_url, format!("/status/{}", ack.message_id));

        let p = pipeline.clone();
        let id = ack.message_id.clone();
        wait_until(|| {
            p.status(&id)
                .is_some_and(|s| s.state == PipelineState::Completed)
        })
        .await;

        let replay = pipeline.replay(&ack.message_id).unwrap();
        let events: Vec<&str> = replay.events.iter().map(|e| e.event.as_str()).collect();
        assert!(events.contains(&"route_enqueued"));
        assert!(events.contains(&"worker_received"));
        assert!(events.contains(&"worker_completed"));
        assert!(events.contains(&"worker_result"));
        let response = replay.response.unwrap();
        assert_eq!(response["payload"]["handled_by"], "terminal.echo");
    }

    #[tokio::test]
    async fn duplicate_delivery_commits_side_effects_once() {
        let (_dir, pipeline) = fixture();
        let value = request("chat.general", json!({"text": "twice"}));
        let first = pipeline.route_async(value.clone()).unwrap();
        pipeline.route_async(value).unwrap();

        let p = pipeline.clone();
        let id = first.message_id.clone();
        wait_until(|| {
            p.control()
                .events(&id)
                .iter()
                .any(|e| e.event == "duplicate_delivery")
        })
        .await;
        wait_until(|| {
            p.status(&id)
                .is_some_and(|s| s.state == PipelineState::Completed)
        })
        .await;

        let debug = pipeline.debug_idempotency("terminal.echo", &first.message_id);
        assert_eq!(debug["side_effect_count"], 1);
        assert!(debug["duplicate_event_count"].as_u64().unwrap() >= 1);
        assert_eq!(
            pipeline.status(&first.message_id).unwrap().state,
            PipelineState::Completed
        );
    }

    #[tokio::test]
    async fn forced_errors_retry_then_dead_letter() {
        let (_dir, pipeline) = fixture();
        let value = request("chat.general", json!({"text": "boom", "force_error": true}));
        let ack = pipeline.route_async(value).unwrap();

        let p = pipeline.clone();
        let id = ack.message_id.clone();
        wait_until(|| p.status(&id).is_some_and(|s| s.state == PipelineState::Dlq)).await;

        let replay = pipeline.replay(&ack.message_id).unwrap();
        let retries = replay
            .events
            .iter()
            .filter(|e| e.event == "retry_scheduled")
            .count();
        assert_eq!(retries, 2, "attempts 1 and 2 are retried, attempt 3 dead-letters");
        assert!(replay.events.iter().any(|e| e.event == "worker_dead_lettered"));

        let response = replay.response.unwrap();
        assert_eq!(response["payload"]["error"]["code"], "E_NODE_TIMEOUT");

        let dead = pipeline.dead_letters("chat.general");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0]["dead_lettered"], true);
    }

    #[tokio::test]
    async fn unknown_intent_is_rejected_synchronously() {
        let (_dir, pipeline) = fixture();
        let err = pipeline
            .route_async(request("no.such.capability", json!({})))
            .unwrap_err();
        assert_eq!(err.error_code(), Some("E_NO_ROUTE"));
    }

    #[tokio::test]
    async fn invalid_worker_response_is_wrapped() {
        let (_dir, pipeline) = fixture();
        let value = request("chat.general", json!({"text": "x"}));
        let ack = pipeline.route_async(value).unwrap();
        let p = pipeline.clone();
        let id = ack.message_id.clone();
        wait_until(|| p.status(&id).is_some_and(|s| s.state.is_terminal())).await;

        pipeline.apply_worker_result(WorkerResult {
            message_id: "m-invalid".to_string(),
            node_id: "terminal.echo".to_string(),
            response: json!("not a message"),
            attempt: 0,
            duplicate: false,
            dead_lettered: false,
        });
        let status = pipeline.status("m-invalid").unwrap();
        assert_eq!(status.state, PipelineState::Error);
        let response = status.response.unwrap();
        assert_eq!(response["payload"]["error"]["code"], "E_NODE_ERROR");
    }

    #[tokio::test]
    async fn wrong_protocol_version_never_enqueues() {
        let (_dir, pipeline) = fixture();
        let mut value = request("chat.general", json!({}));
        value["protocol_version"] = json!("0.0");
        let err = pipeline.route_async(value).unwrap_err();
        assert_eq!(err.error_code(), Some("E_UNSUPPORTED_PROTOCOL"));
    }

    #[test]
    fn envelope_defaults() {
        let envelope: AsyncEnvelope = serde_json::from_value(json!({
            "message": {"message_id": "m"},
            "node_id": "n",
            "routing_key": "chat",
        }))
        .unwrap();
        assert_eq!(envelope.attempt, 0);
        assert_eq!(envelope.max_attempts, 3);
    }
}
