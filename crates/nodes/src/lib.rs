//! Built-in capability providers.
//!
//! Each node implements `CapabilityNode` against a shared [`NodeContext`].
//! Nodes that need to call back into the router hold the injected `route`
//! function reference; ownership stays acyclic (the runtime owns the
//! router, nodes hold only the closure).

mod approval;
mod audit;
mod chat;
mod folder;
mod git_ops;
mod memory_fs;
mod model;

pub use approval::ApprovalGateNode;
pub use audit::AuditLogNode;
pub use chat::ChatGeneralNode;
pub use folder::FolderWorkflowNode;
pub use git_ops::GitOpsNode;
pub use memory_fs::MemoryFsNode;
pub use model::ModelNode;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};

use patchbay_core::{CapabilityMetadata, Idempotency, RiskClass, RouteFn, SideEffectScope};
use patchbay_persistence::{Persistence, WorkflowState};

/// Everything a node needs from its host.
#[derive(Clone)]
pub struct NodeContext {
    pub library_root: PathBuf,
    pub persistence: Arc<Persistence>,
    pub registration_token: String,
    pub workflow_state: Arc<WorkflowState>,
    pub env: HashMap<String, String>,
    /// Injected router entry point for nodes that compose sub-calls.
    pub route: Option<RouteFn>,
}

impl NodeContext {
    pub fn env_value(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Capability metadata shorthand used by every built-in node.
#[allow(clippy::too_many_arguments)]
pub fn cap(
    name: &str,
    description: &str,
    input_schema: Value,
    risk_class: RiskClass,
    required_extensions: &[&str],
    approval_required: bool,
    examples: &[&str],
    idempotency: Idempotency,
    side_effect_scope: SideEffectScope,
) -> CapabilityMetadata {
    CapabilityMetadata {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
        risk_class,
        required_extensions: required_extensions.iter().map(|s| s.to_string()).collect(),
        approval_required,
        examples: examples.iter().map(|s| s.to_string()).collect(),
        idempotency,
        side_effect_scope,
        capability_version: "0.1.0".to_string(),
        provider: None,
    }
}

/// Resolve a library-relative path, rejecting absolutes and traversal.
pub fn safe_path(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let rel = relative.trim().replace('\\', "/");
    if rel.is_empty() {
        return Err("path is required".to_string());
    }
    if rel.starts_with('/') {
        return Err("path traversal rejected".to_string());
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in rel.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err("path traversal rejected".to_string());
                }
            }
            other => parts.push(other),
        }
    }
    Ok(root.join(parts.join("/")))
}

/// An empty-object JSON schema with required keys, the shape every
/// built-in capability declares.
pub fn object_schema(required: &[&str]) -> Value {
    if required.is_empty() {
        json!({"type": "object"})
    } else {
        json!({"type": "object", "required": required})
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn context() -> (TempDir, NodeContext) {
        let dir = TempDir::new().unwrap();
        let library_root = dir.path().join("library");
        std::fs::create_dir_all(&library_root).unwrap();
        let persistence = Arc::new(Persistence::new(dir.path().join("data")).unwrap());
        let workflow_state = Arc::new(WorkflowState::new(persistence.clone()));
        let ctx = NodeContext {
            library_root,
            persistence,
            registration_token: "node-test-token".to_string(),
            workflow_state,
            env: HashMap::new(),
            route: None,
        };
        (dir, ctx)
    }

    pub fn message(intent: &str, payload: Value) -> patchbay_core::Message {
        patchbay_core::validate_core(&json!({
            "protocol_version": patchbay_core::PROTOCOL_VERSION,
            "message_id": patchbay_core::new_uuid(),
            "intent": intent,
            "payload": payload,
        }))
        .unwrap()
    }

    pub fn approved(mut message: patchbay_core::Message) -> patchbay_core::Message {
        message.extensions.insert(
            "confirmation".to_string(),
            json!({"required": true, "status": "approved", "request_id": "appr-test"}),
        );
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_path_confines_to_root() {
        let root = Path::new("/srv/library");
        assert_eq!(
            safe_path(root, "finances/spec.md").unwrap(),
            root.join("finances/spec.md")
        );
        assert_eq!(safe_path(root, "./a/./b").unwrap(), root.join("a/b"));
        assert_eq!(safe_path(root, "a/../b").unwrap(), root.join("b"));
        assert!(safe_path(root, "../outside").is_err());
        assert!(safe_path(root, "a/../../outside").is_err());
        assert!(safe_path(root, "/etc/passwd").is_err());
        assert!(safe_path(root, "   ").is_err());
    }
}
