//! The `CapabilityNode` trait — the in-process arm of the handler variant.
//!
//! A handler is either an in-process node implementing this trait or a
//! remote HTTP endpoint; both are invocable as `Message → Message`. Nodes
//! that need to call back into the router receive an injected [`RouteFn`]
//! at construction time, keeping ownership acyclic: the runtime owns the
//! registry and router, nodes hold only a function reference.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::metadata::{CapabilityMetadata, NodeDescriptor};
use crate::protocol::{Message, PROTOCOL_VERSION};

/// Boxed future returned by the injected route capability.
pub type RouteFuture = Pin<Box<dyn Future<Output = Message> + Send + 'static>>;

/// A router entry point handed to nodes; a function reference, not
/// ownership.
pub type RouteFn = Arc<dyn Fn(Message) -> RouteFuture + Send + Sync>;

/// A capability provider living in this process.
#[async_trait]
pub trait CapabilityNode: Send + Sync {
    /// Unique node id, e.g. `node.memory.fs`.
    fn node_id(&self) -> &str;

    fn node_version(&self) -> &str {
        "0.1.0"
    }

    /// Higher wins during candidate selection.
    fn priority(&self) -> i64 {
        100
    }

    /// The capabilities this node claims, with full metadata.
    fn capabilities(&self) -> Vec<CapabilityMetadata>;

    /// Handle one message. Errors are returned as error envelopes, never
    /// panics.
    async fn handle(&self, message: Message) -> Message;

    /// The descriptor this node registers with.
    fn descriptor(&self, registration_token: &str) -> NodeDescriptor {
        let mut auth = Map::new();
        auth.insert(
            "registration_token".to_string(),
            Value::String(registration_token.to_string()),
        );
        NodeDescriptor {
            node_id: self.node_id().to_string(),
            node_version: self.node_version().to_string(),
            endpoint_url: format!("inproc://{}", self.node_id()),
            supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
            capabilities: self.capabilities(),
            requires: Vec::new(),
            priority: self.priority(),
            auth,
        }
    }
}
