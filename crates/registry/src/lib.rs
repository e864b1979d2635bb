//! The capability registry: the single shared mutable structure in the
//! router.
//!
//! Nodes register a descriptor and receive a lease token; leases are
//! refreshed by heartbeat and lazily pruned before every read. All read
//! methods prune under the lock, clone, and release before returning, so
//! handlers never run while the lock is held. Every write persists a
//! snapshot for crash recovery; reloaded records carry no handler (remote
//! nodes re-register).

mod health;

pub use health::{EWMA_ALPHA, NodeHealth};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, NodeDescriptor, RiskClass, now_iso,
    parse_version,
};
use patchbay_persistence::Persistence;

const SNAPSHOT_NAME: &str = "router_registry";

/// Registration and lease failures, each mapping to a protocol error code.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("registration token invalid")]
    Untrusted,

    #[error("node not registered")]
    NotRegistered,

    #[error("invalid lease token")]
    InvalidLease,
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidDescriptor(_) => ErrorCode::NodeRegInvalid,
            Self::Untrusted | Self::InvalidLease => ErrorCode::NodeUntrusted,
            Self::NotRegistered => ErrorCode::NodeNotRegistered,
        }
    }
}

/// Successful registration reply.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterAck {
    pub node_id: String,
    pub lease_token: String,
    pub heartbeat_ttl_sec: f64,
}

/// One provider summary inside the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub node_id: String,
    pub node_version: String,
    pub priority: i64,
    pub required_extensions: Vec<String>,
    pub risk_class: RiskClass,
    pub approval_required: bool,
    pub provider: Option<String>,
    pub capability_version: String,
}

/// A registry entry: descriptor plus lease bookkeeping and the optional
/// in-process handler.
#[derive(Clone)]
pub struct NodeRecord {
    pub descriptor: NodeDescriptor,
    pub handler: Option<Arc<dyn CapabilityNode>>,
    pub lease_token: String,
    pub expires_at_epoch: f64,
    pub registered_at: String,
    pub last_heartbeat_at: String,
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRecord")
            .field("node_id", &self.descriptor.node_id)
            .field("in_process", &self.handler.is_some())
            .field("expires_at_epoch", &self.expires_at_epoch)
            .finish()
    }
}

impl NodeRecord {
    /// Public view for the registry snapshot: descriptor fields plus lease
    /// state. The persistence scrubber redacts lease and auth tokens on
    /// their way to disk.
    pub fn to_public(&self) -> Value {
        let mut item = serde_json::to_value(&self.descriptor).unwrap_or_else(|_| json!({}));
        if let Some(map) = item.as_object_mut() {
            map.insert("lease_token".to_string(), json!(self.lease_token));
            map.insert("registered_at".to_string(), json!(self.registered_at));
            map.insert("last_heartbeat_at".to_string(), json!(self.last_heartbeat_at));
            map.insert("expires_at_epoch".to_string(), json!(self.expires_at_epoch));
            let status = if self.expires_at_epoch > now_epoch() {
                "active"
            } else {
                "stale"
            };
            map.insert("status".to_string(), json!(status));
        }
        item
    }
}

struct RegistryInner {
    records: HashMap<String, NodeRecord>,
    health: HashMap<String, NodeHealth>,
}

/// Owner of all `NodeRecord`s, guarded by one exclusive lock.
pub struct NodeRegistry {
    persistence: Arc<Persistence>,
    registration_token: String,
    heartbeat_ttl_sec: f64,
    inner: Mutex<RegistryInner>,
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl NodeRegistry {
    pub fn new(
        persistence: Arc<Persistence>,
        registration_token: impl Into<String>,
        heartbeat_ttl_sec: f64,
    ) -> Self {
        let registry = Self {
            persistence,
            registration_token: registration_token.into(),
            heartbeat_ttl_sec,
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                health: HashMap::new(),
            }),
        };
        registry.load_snapshot();
        registry
    }

    pub fn heartbeat_ttl_sec(&self) -> f64 {
        self.heartbeat_ttl_sec
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate the descriptor and the shared secret, mint a lease, replace
    /// any prior record for the node id, persist, and emit
    /// `router.node_registered`.
    pub fn register(
        &self,
        descriptor: NodeDescriptor,
        handler: Option<Arc<dyn CapabilityNode>>,
    ) -> Result<RegisterAck, RegistryError> {
        descriptor
            .validate()
            .map_err(RegistryError::InvalidDescriptor)?;

        if descriptor.registration_token() != Some(self.registration_token.as_str()) {
            return Err(RegistryError::Untrusted);
        }

        let lease_token = Uuid::new_v4().to_string();
        let record = NodeRecord {
            handler,
            lease_token: lease_token.clone(),
            expires_at_epoch: now_epoch() + self.heartbeat_ttl_sec,
            registered_at: now_iso(),
            last_heartbeat_at: now_iso(),
            descriptor,
        };
        let node_id = record.descriptor.node_id.clone();
        let capability_count = record.descriptor.capabilities.len();

        {
            let mut inner = self.lock();
            inner.records.insert(node_id.clone(), record);
            inner.health.entry(node_id.clone()).or_default();
            self.save_snapshot_locked(&inner);
        }

        self.persistence.emit_event(
            "router",
            "router.node_registered",
            json!({"node_id": node_id, "capability_count": capability_count}),
        );
        debug!(node_id = %node_id, "Node registered");

        Ok(RegisterAck {
            node_id,
            lease_token,
            heartbeat_ttl_sec: self.heartbeat_ttl_sec,
        })
    }

    /// Refresh a lease. Requires an exact lease-token match.
    pub fn heartbeat(&self, node_id: &str, lease_token: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(node_id)
            .filter(|rec| rec.expires_at_epoch > now_epoch())
            .ok_or(RegistryError::NotRegistered)?;
        if record.lease_token != lease_token {
            return Err(RegistryError::InvalidLease);
        }
        record.last_heartbeat_at = now_iso();
        record.expires_at_epoch = now_epoch() + self.heartbeat_ttl_sec;
        self.save_snapshot_locked(&inner);
        Ok(())
    }

    /// Drop expired records. Called lazily before every read.
    pub fn prune_stale(&self) {
        let mut inner = self.lock();
        let now = now_epoch();
        let stale: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, rec)| rec.expires_at_epoch <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        for node_id in &stale {
            inner.records.remove(node_id);
            debug!(node_id = %node_id, "Pruned stale node lease");
        }
        self.save_snapshot_locked(&inner);
    }

    /// All live records, cloned.
    pub fn active_records(&self) -> Vec<NodeRecord> {
        self.prune_stale();
        let inner = self.lock();
        inner.records.values().cloned().collect()
    }

    /// One live record, cloned.
    pub fn get_record(&self, node_id: &str) -> Option<NodeRecord> {
        self.prune_stale();
        let inner = self.lock();
        inner.records.get(node_id).cloned()
    }

    /// Re-bind an in-process handler after a snapshot reload.
    pub fn attach_handler(&self, node_id: &str, handler: Arc<dyn CapabilityNode>) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(node_id) {
            record.handler = Some(handler);
        }
    }

    /// Fold one invocation outcome into the node's health.
    pub fn update_health(&self, node_id: &str, success: bool, latency_ms: Option<f64>) {
        let mut inner = self.lock();
        inner
            .health
            .entry(node_id.to_string())
            .or_default()
            .record(success, latency_ms);
        self.save_snapshot_locked(&inner);
    }

    /// Current health for a node, cloned.
    pub fn health_of(&self, node_id: &str) -> Option<NodeHealth> {
        let inner = self.lock();
        inner.health.get(node_id).cloned()
    }

    /// Capability name → provider summaries, over live records only.
    pub fn catalog(&self) -> BTreeMap<String, Vec<CatalogEntry>> {
        self.prune_stale();
        let inner = self.lock();
        let mut catalog: BTreeMap<String, Vec<CatalogEntry>> = BTreeMap::new();
        for record in inner.records.values() {
            for capability in &record.descriptor.capabilities {
                catalog
                    .entry(capability.name.clone())
                    .or_default()
                    .push(CatalogEntry {
                        node_id: record.descriptor.node_id.clone(),
                        node_version: record.descriptor.node_version.clone(),
                        priority: record.descriptor.priority,
                        required_extensions: capability.required_extensions.clone(),
                        risk_class: capability.risk_class,
                        approval_required: capability.approval_required,
                        provider: capability.provider.clone(),
                        capability_version: capability.capability_version.clone(),
                    });
            }
        }
        // Deterministic within each capability as well.
        for entries in catalog.values_mut() {
            entries.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| parse_version(&b.node_version).cmp(&parse_version(&a.node_version)))
                    .then_with(|| a.node_id.cmp(&b.node_id))
            });
        }
        catalog
    }

    /// The canonical metadata for an intent: best provider by the total
    /// selection order (priority desc, node version desc, node id asc).
    pub fn capability_metadata(&self, intent: &str) -> Option<CapabilityMetadata> {
        self.prune_stale();
        let inner = self.lock();
        let mut candidates: Vec<(i64, (u64, u64, u64), String, CapabilityMetadata)> = Vec::new();
        for record in inner.records.values() {
            if let Some(capability) = record.descriptor.capability(intent) {
                candidates.push((
                    record.descriptor.priority,
                    parse_version(&record.descriptor.node_version),
                    record.descriptor.node_id.clone(),
                    capability.clone(),
                ));
            }
        }
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        candidates.into_iter().next().map(|(_, _, _, cap)| cap)
    }

    /// Public snapshot: all live records with health attached.
    pub fn snapshot(&self) -> Value {
        self.prune_stale();
        let inner = self.lock();
        self.snapshot_payload_locked(&inner)
    }

    fn snapshot_payload_locked(&self, inner: &RegistryInner) -> Value {
        let mut nodes: Vec<Value> = Vec::with_capacity(inner.records.len());
        for (node_id, record) in &inner.records {
            let mut item = record.to_public();
            if let Some(map) = item.as_object_mut() {
                let health = inner.health.get(node_id).cloned().unwrap_or_default();
                map.insert(
                    "health".to_string(),
                    serde_json::to_value(health).unwrap_or_else(|_| json!({})),
                );
            }
            nodes.push(item);
        }
        nodes.sort_by_key(|item| {
            item.get("node_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });
        json!({"nodes": nodes})
    }

    fn save_snapshot_locked(&self, inner: &RegistryInner) {
        let payload = self.snapshot_payload_locked(inner);
        if let Err(e) = self.persistence.save_state(SNAPSHOT_NAME, &payload) {
            warn!(error = %e, "Registry snapshot write failed");
        }
    }

    fn load_snapshot(&self) {
        let payload = self.persistence.load_state(SNAPSHOT_NAME, json!({"nodes": []}));
        let Some(nodes) = payload.get("nodes").and_then(Value::as_array) else {
            return;
        };

        let mut inner = self.lock();
        for item in nodes {
            let Ok(descriptor) = NodeDescriptor::from_value(item) else {
                continue;
            };
            let node_id = descriptor.node_id.clone();
            let record = NodeRecord {
                descriptor,
                handler: None,
                lease_token: string_field(item, "lease_token"),
                expires_at_epoch: item
                    .get("expires_at_epoch")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                registered_at: string_field_or_now(item, "registered_at"),
                last_heartbeat_at: string_field_or_now(item, "last_heartbeat_at"),
            };
            let health = item
                .get("health")
                .cloned()
                .and_then(|value| serde_json::from_value::<NodeHealth>(value).ok())
                .unwrap_or_default();
            inner.records.insert(node_id.clone(), record);
            inner.health.insert(node_id, health);
        }
    }
}

fn string_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_field_or_now(item: &Value, key: &str) -> String {
    let value = string_field(item, key);
    if value.is_empty() { now_iso() } else { value }
}

/// Order candidate records by the total selection order. Ties on priority
/// and version break toward the lexicographically smaller node id.
pub fn sort_candidates(records: &mut [NodeRecord]) {
    records.sort_by(|a, b| {
        b.descriptor
            .priority
            .cmp(&a.descriptor.priority)
            .then_with(|| {
                parse_version(&b.descriptor.node_version)
                    .cmp(&parse_version(&a.descriptor.node_version))
            })
            .then_with(|| a.descriptor.node_id.cmp(&b.descriptor.node_id))
    });
}
