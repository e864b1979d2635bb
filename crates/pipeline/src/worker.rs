//! The capability worker: consumes one queue with at-most-once side
//! effects per message.
//!
//! Delivery processing order: receive → protocol/extension validation →
//! idempotency gate → side-effect commit → real work → result post. The
//! `force_error` payload hook and retryable downstream failures share the
//! retry path: the idempotency and side-effect marks taken for the failed
//! attempt are rolled back before the envelope is republished, so the
//! retried delivery is not misread as a duplicate and the side-effect
//! counter stays at one for settled messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use patchbay_core::{
    ErrorCode, Message, PROTOCOL_VERSION, ensure_trace, make_error_with, validate_core,
};

use crate::broker::{Broker, EX_CAPABILITY, EX_DLQ, EX_LOG, MessageQueue};
use crate::control::{ControlStore, idempotency_key, node_response_key, side_effect_key};

/// The broker-carried wrapper around a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncEnvelope {
    pub message: Value,
    pub node_id: String,
    pub routing_key: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

/// What a worker reports back to the router after each delivery settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub message_id: String,
    pub node_id: String,
    pub response: Value,
    pub attempt: u32,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub dead_lettered: bool,
}

/// Performs the real work of a delivery (typically: invoke the pinned
/// node).
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, node_id: &str, message: &Message) -> Message;
}

/// Receives settled results (in-process apply or HTTP callback).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn post(&self, result: WorkerResult);
}

/// One consumer loop over one capability queue.
pub struct CapabilityWorker {
    pub(crate) queue: Arc<MessageQueue>,
    pub(crate) broker: Arc<Broker>,
    pub(crate) control: Arc<ControlStore>,
    pub(crate) executor: Arc<dyn WorkExecutor>,
    pub(crate) sink: Arc<dyn ResultSink>,
    pub(crate) retry_delay: Duration,
    pub(crate) required_extensions: Vec<String>,
}

impl CapabilityWorker {
    /// Consume deliveries forever. Prefetch is one by construction: the
    /// next delivery is taken only after the current one fully settles.
    pub async fn run(self: Arc<Self>) {
        loop {
            let body = self.queue.pop().await;
            self.process_delivery(body).await;
        }
    }

    fn publish_log(&self, message_id: &str, event: &str, details: Value) {
        self.broker.publish(
            EX_LOG,
            "",
            json!({"event": event, "message_id": message_id, "details": details}),
        );
    }

    async fn settle(&self, message_id: &str, node_id: &str, response: Value, attempt: u32, duplicate: bool, dead_lettered: bool) {
        self.sink
            .post(WorkerResult {
                message_id: message_id.to_string(),
                node_id: node_id.to_string(),
                response,
                attempt,
                duplicate,
                dead_lettered,
            })
            .await;
    }

    /// Process one delivery to completion.
    pub async fn process_delivery(&self, body: Value) {
        let envelope: AsyncEnvelope = match serde_json::from_value(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, queue = %self.queue.name(), "Dropping unparseable envelope");
                return;
            }
        };
        let node_id = envelope.node_id.clone();
        let attempt = envelope.attempt;

        let Some(message_id) = envelope
            .message
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!(queue = %self.queue.name(), "Dropping envelope without message_id");
            return;
        };

        self.control.append_event(
            &message_id,
            "worker_received",
            json!({"node_id": node_id, "attempt": attempt}),
        );
        self.publish_log(&message_id, "worker_received", json!({"node_id": node_id, "attempt": attempt}));

        let response_key = node_response_key(&node_id, &message_id);

        // Protocol and extension validation happen before any bookkeeping;
        // a malformed message settles immediately with a cached error.
        let message = match validate_core(&envelope.message) {
            Ok(message) => message,
            Err(err) => {
                let response = serde_json::to_value(&*err).unwrap_or_else(|_| json!({}));
                self.control.cache_response(&response_key, response.clone());
                self.settle(&message_id, &node_id, response, attempt, false, false).await;
                return;
            }
        };

        if message.protocol_version != PROTOCOL_VERSION {
            let err = make_error_with(
                ErrorCode::UnsupportedProtocol,
                &format!("{node_id} supports protocol {PROTOCOL_VERSION}"),
                Some(&message_id),
                false,
                json!({}),
            );
            let response = serde_json::to_value(&err).unwrap_or_else(|_| json!({}));
            self.control.cache_response(&response_key, response.clone());
            self.settle(&message_id, &node_id, response, attempt, false, false).await;
            return;
        }

        let missing: Vec<&String> = self
            .required_extensions
            .iter()
            .filter(|req| !message.extensions.contains_key(*req))
            .collect();
        if !missing.is_empty() {
            let err = make_error_with(
                ErrorCode::RequiredExtensionMissing,
                &format!("Missing required extension(s): {}", missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")),
                Some(&message_id),
                false,
                json!({"missing": missing}),
            );
            let response = serde_json::to_value(&err).unwrap_or_else(|_| json!({}));
            self.control.cache_response(&response_key, response.clone());
            self.control.append_event(
                &message_id,
                "worker_error",
                json!({"node_id": node_id, "code": ErrorCode::RequiredExtensionMissing.as_str()}),
            );
            self.publish_log(&message_id, "worker_error", json!({"node_id": node_id}));
            self.settle(&message_id, &node_id, response, attempt, false, false).await;
            return;
        }

        // Idempotency gate: only the first delivery reaches the side-effect
        // step; duplicates replay the cached response.
        let gate_key = idempotency_key(&node_id, &message_id);
        if !self.control.set_if_absent(&gate_key) {
            let response = self.control.cached_response(&response_key).unwrap_or_else(|| {
                serde_json::to_value(make_error_with(
                    ErrorCode::NodeError,
                    &format!("Duplicate delivery but no cached response for {node_id}"),
                    Some(&message_id),
                    false,
                    json!({}),
                ))
                .unwrap_or_else(|_| json!({}))
            });
            self.control.append_event(
                &message_id,
                "duplicate_delivery",
                json!({"node_id": node_id, "attempt": attempt}),
            );
            self.publish_log(&message_id, "duplicate_delivery", json!({"node_id": node_id, "attempt": attempt}));
            self.settle(&message_id, &node_id, response, attempt, true, false).await;
            return;
        }

        // Commit side effects exactly once, then perform the real work.
        let effect_key = side_effect_key(&node_id, &message_id);
        self.control.incr(&effect_key);

        let force_error = message
            .payload
            .get("force_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let response = if force_error {
            make_error_with(
                ErrorCode::NodeTimeout,
                "Simulated retryable failure",
                Some(&message_id),
                true,
                json!({"node_id": node_id, "attempt": attempt}),
            )
        } else {
            self.executor.execute(&node_id, &message).await
        };

        if response.is_error() && response.error_retryable() {
            // Roll back the marks taken for this failed attempt.
            self.control.clear_flag(&gate_key);
            self.control.clear_counter(&effect_key);

            let next_attempt = attempt + 1;
            if next_attempt < envelope.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
                let retry = AsyncEnvelope {
                    message: envelope.message.clone(),
                    node_id: node_id.clone(),
                    routing_key: envelope.routing_key.clone(),
                    attempt: next_attempt,
                    max_attempts: envelope.max_attempts,
                };
                self.broker.publish(
                    EX_CAPABILITY,
                    &envelope.routing_key,
                    serde_json::to_value(retry).unwrap_or_else(|_| json!({})),
                );
                self.control.append_event(
                    &message_id,
                    "retry_scheduled",
                    json!({"node_id": node_id, "attempt": next_attempt}),
                );
                self.publish_log(&message_id, "retry_scheduled", json!({"node_id": node_id, "attempt": next_attempt}));
                return;
            }

            // Retry budget exhausted: dead-letter the envelope.
            let terminal = make_error_with(
                ErrorCode::NodeTimeout,
                &format!("{node_id} exceeded max attempts"),
                Some(&message_id),
                true,
                json!({"node_id": node_id, "attempt": next_attempt}),
            );
            let terminal_value = serde_json::to_value(&terminal).unwrap_or_else(|_| json!({}));
            self.broker.publish(
                EX_DLQ,
                &envelope.routing_key,
                json!({
                    "message": envelope.message,
                    "node_id": node_id,
                    "attempt": next_attempt,
                    "dead_lettered": true,
                    "error": terminal_value,
                }),
            );
            self.control.cache_response(&response_key, terminal_value.clone());
            self.control.append_event(
                &message_id,
                "worker_dead_lettered",
                json!({"node_id": node_id, "attempt": next_attempt}),
            );
            self.publish_log(&message_id, "worker_dead_lettered", json!({"node_id": node_id, "attempt": next_attempt}));
            self.settle(&message_id, &node_id, terminal_value, next_attempt, false, true).await;
            return;
        }

        let mut response = response;
        ensure_trace(&mut response, Some(&message_id), Some(&format!("{node_id}.worker")));
        let response_value = serde_json::to_value(&response).unwrap_or_else(|_| json!({}));
        self.control.cache_response(&response_key, response_value.clone());

        if response.is_error() {
            self.control.append_event(
                &message_id,
                "worker_error",
                json!({"node_id": node_id, "code": response.error_code()}),
            );
            self.publish_log(&message_id, "worker_error", json!({"node_id": node_id, "code": response.error_code()}));
        } else {
            self.control.append_event(
                &message_id,
                "worker_completed",
                json!({"node_id": node_id, "attempt": attempt, "intent": response.intent}),
            );
            self.publish_log(&message_id, "worker_completed", json!({"node_id": node_id, "attempt": attempt}));
        }
        debug!(message_id = %message_id, node_id = %node_id, "Delivery settled");
        self.settle(&message_id, &node_id, response_value, attempt, false, false).await;
    }
}
