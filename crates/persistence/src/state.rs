//! Process-wide workflow state: a locked key-value map over persistence.
//!
//! Every operation reloads from disk before acting, so multiple processes
//! sharing a data root converge on the same view.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};

use crate::store::{Persistence, PersistenceError};

const STATE_NAME: &str = "workflow_state";

/// Shared mutable workflow context (active folder, interview progress,
/// settings).
pub struct WorkflowState {
    persistence: Arc<Persistence>,
    lock: Mutex<()>,
}

impl WorkflowState {
    pub fn new(persistence: Arc<Persistence>) -> Self {
        Self {
            persistence,
            lock: Mutex::new(()),
        }
    }

    fn normalize(mut state: Map<String, Value>) -> Map<String, Value> {
        state.entry("active_folder".to_string()).or_insert_with(|| json!(""));
        state.entry("interviews".to_string()).or_insert_with(|| json!({}));
        state.entry("settings".to_string()).or_insert_with(|| json!({}));
        state
    }

    fn reload(&self) -> Map<String, Value> {
        let loaded = self.persistence.load_state(STATE_NAME, json!({}));
        let map = loaded.as_object().cloned().unwrap_or_default();
        Self::normalize(map)
    }

    /// The full state, freshly reloaded.
    pub fn get(&self) -> Map<String, Value> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.reload()
    }

    /// One field of the state, or `default` when absent.
    pub fn read(&self, key: &str, default: Value) -> Value {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.reload().get(key).cloned().unwrap_or(default)
    }

    /// Shallow-merge `patch` into the state and persist.
    pub fn update(&self, patch: Map<String, Value>) -> Result<Map<String, Value>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.reload();
        for (key, value) in patch {
            state.insert(key, value);
        }
        self.persistence.save_state(STATE_NAME, &Value::Object(state.clone()))?;
        Ok(state)
    }

    /// Apply `mutator` to a fresh copy of the state and persist the result.
    pub fn mutate<F>(&self, mutator: F) -> Result<Map<String, Value>, PersistenceError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.reload();
        mutator(&mut state);
        self.persistence.save_state(STATE_NAME, &Value::Object(state.clone()))?;
        Ok(state)
    }
}
