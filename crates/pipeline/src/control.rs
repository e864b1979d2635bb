//! The control plane: per-message status, ordered events, idempotency
//! flags, side-effect counters, and cached responses.
//!
//! A single-writer key-value store keyed with the `bdp:` scheme. Status
//! transitions are forward-only: queued → (completed | error | dlq); a
//! settled entry never moves to a different terminal state.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use patchbay_core::now_iso;

/// Lifecycle of an async message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Queued,
    Completed,
    Error,
    Dlq,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        self != Self::Queued
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Dlq => "dlq",
        }
    }
}

/// The status projection for one message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub updated_at: String,
    #[serde(default)]
    pub details: Value,
}

/// One entry of the append-only replay log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub event: String,
    pub details: Value,
}

pub fn idempotency_key(node_id: &str, message_id: &str) -> String {
    format!("bdp:idempotency:{node_id}:{message_id}")
}

pub fn side_effect_key(node_id: &str, message_id: &str) -> String {
    format!("bdp:side_effect:{node_id}:{message_id}")
}

pub fn node_response_key(node_id: &str, message_id: &str) -> String {
    format!("bdp:node_response:{node_id}:{message_id}")
}

#[derive(Default)]
struct ControlInner {
    status: HashMap<String, StatusEntry>,
    events: HashMap<String, Vec<EventEntry>>,
    flags: HashMap<String, String>,
    counters: HashMap<String, i64>,
    cached: HashMap<String, Value>,
}

/// In-memory single-writer control store.
#[derive(Default)]
pub struct ControlStore {
    inner: Mutex<ControlInner>,
}

impl ControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a fresh enqueue.
    pub fn set_queued(&self, message_id: &str, intent: &str, node_id: &str, request: Value) {
        let mut inner = self.lock();
        inner.status.insert(
            message_id.to_string(),
            StatusEntry {
                state: PipelineState::Queued,
                intent: Some(intent.to_string()),
                node_id: Some(node_id.to_string()),
                request: Some(request),
                response: None,
                updated_at: now_iso(),
                details: json!({"correlation_id": message_id}),
            },
        );
    }

    /// Resolve a message to a terminal state, merging into the queued
    /// entry. Returns false when the transition was refused (already
    /// settled differently).
    pub fn resolve(
        &self,
        message_id: &str,
        state: PipelineState,
        node_id: &str,
        response: Value,
        details: Value,
    ) -> bool {
        let mut inner = self.lock();
        let entry = inner
            .status
            .entry(message_id.to_string())
            .or_insert_with(|| StatusEntry {
                state: PipelineState::Queued,
                intent: None,
                node_id: None,
                request: None,
                response: None,
                updated_at: now_iso(),
                details: json!({}),
            });

        if entry.state.is_terminal() && entry.state != state {
            return false;
        }

        entry.state = state;
        entry.node_id = Some(node_id.to_string());
        entry.response = Some(response);
        entry.details = details;
        entry.updated_at = now_iso();
        true
    }

    pub fn status(&self, message_id: &str) -> Option<StatusEntry> {
        self.lock().status.get(message_id).cloned()
    }

    /// Append one replay event; ordering is total per message id.
    pub fn append_event(&self, message_id: &str, event: &str, details: Value) {
        self.lock()
            .events
            .entry(message_id.to_string())
            .or_default()
            .push(EventEntry {
                ts: now_iso(),
                event: event.to_string(),
                details,
            });
    }

    pub fn events(&self, message_id: &str) -> Vec<EventEntry> {
        self.lock()
            .events
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Set-if-absent. Returns true on first set.
    pub fn set_if_absent(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if inner.flags.contains_key(key) {
            return false;
        }
        inner.flags.insert(key.to_string(), "1".to_string());
        true
    }

    /// Release a flag taken with [`Self::set_if_absent`].
    pub fn clear_flag(&self, key: &str) {
        self.lock().flags.remove(key);
    }

    pub fn incr(&self, key: &str) -> i64 {
        let mut inner = self.lock();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.lock().counters.get(key).copied().unwrap_or(0)
    }

    pub fn clear_counter(&self, key: &str) {
        self.lock().counters.remove(key);
    }

    pub fn cache_response(&self, key: &str, response: Value) {
        self.lock().cached.insert(key.to_string(), response);
    }

    pub fn cached_response(&self, key: &str) -> Option<Value> {
        self.lock().cached.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_if_absent_is_first_writer_wins() {
        let store = ControlStore::new();
        let key = idempotency_key("node.echo", "m-1");
        assert!(store.set_if_absent(&key));
        assert!(!store.set_if_absent(&key));
        store.clear_flag(&key);
        assert!(store.set_if_absent(&key));
    }

    #[test]
    fn counters_increment() {
        let store = ControlStore::new();
        let key = side_effect_key("node.echo", "m-1");
        assert_eq!(store.counter(&key), 0);
        assert_eq!(store.incr(&key), 1);
        assert_eq!(store.incr(&key), 2);
        store.clear_counter(&key);
        assert_eq!(store.counter(&key), 0);
    }

    #[test]
    fn transitions_are_forward_only() {
        let store = ControlStore::new();
        store.set_queued("m-1", "chat", "node.echo", json!({"intent": "chat"}));
        assert!(store.resolve("m-1", PipelineState::Completed, "node.echo", json!({}), json!({})));
        // A later conflicting terminal state is refused...
        assert!(!store.resolve("m-1", PipelineState::Dlq, "node.echo", json!({}), json!({})));
        // ...but re-posting the same terminal state (duplicate delivery) is
        // accepted.
        assert!(store.resolve("m-1", PipelineState::Completed, "node.echo", json!({}), json!({"duplicate": true})));

        let entry = store.status("m-1").unwrap();
        assert_eq!(entry.state, PipelineState::Completed);
        assert!(entry.request.is_some());
        assert_eq!(entry.details["duplicate"], true);
    }

    #[test]
    fn events_keep_insertion_order() {
        let store = ControlStore::new();
        store.append_event("m-1", "route_enqueued", json!({}));
        store.append_event("m-1", "worker_received", json!({}));
        store.append_event("m-1", "worker_completed", json!({}));
        let events: Vec<String> = store.events("m-1").into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["route_enqueued", "worker_received", "worker_completed"]);
    }
}
