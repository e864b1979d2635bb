//! Capability and node self-description metadata.
//!
//! A node registers a `NodeDescriptor` listing the capabilities it claims.
//! The router trusts this metadata for everything safety-related: risk
//! class, side-effect scope, required extensions, and approval gating.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Providers a model capability may be pinned to.
pub const MODEL_PROVIDERS: &[&str] = &["openrouter", "ollama"];

/// How dangerous a capability is when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Read,
    Mutate,
    Destructive,
}

/// Whether repeating an invocation is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

/// Where a capability's side effects land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffectScope {
    None,
    File,
    External,
}

/// Self-declared metadata for one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    pub name: String,
    pub description: String,

    /// JSON Schema for the payload; opaque to the router.
    #[serde(default = "empty_schema")]
    pub input_schema: Value,

    pub risk_class: RiskClass,

    #[serde(default)]
    pub required_extensions: Vec<String>,

    #[serde(default)]
    pub approval_required: bool,

    /// At least one example invocation, used by catalog consumers.
    pub examples: Vec<String>,

    pub idempotency: Idempotency,
    pub side_effect_scope: SideEffectScope,

    #[serde(default = "default_capability_version")]
    pub capability_version: String,

    /// Provider tag for model capabilities (e.g. "openrouter", "ollama").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

fn empty_schema() -> Value {
    json!({})
}

fn default_capability_version() -> String {
    "0.1.0".to_string()
}

impl CapabilityMetadata {
    /// Validate invariants serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("capability.name must be non-empty".to_string());
        }
        if !self.input_schema.is_object() {
            return Err(format!("capability {} input_schema must be object", self.name));
        }
        if self.examples.is_empty() || self.examples.iter().any(|e| e.trim().is_empty()) {
            return Err(format!(
                "capability {} examples must contain at least one string",
                self.name
            ));
        }
        if let Some(provider) = &self.provider {
            if !MODEL_PROVIDERS.contains(&provider.as_str()) {
                return Err(format!("capability {} invalid provider", self.name));
            }
        }
        Ok(())
    }
}

/// A capability provider's self-description, presented at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub node_version: String,

    /// `inproc://<node_id>` sentinel or a remote URL.
    pub endpoint_url: String,

    pub supported_protocol_versions: Vec<String>,
    pub capabilities: Vec<CapabilityMetadata>,

    #[serde(default)]
    pub requires: Vec<String>,

    /// Higher wins during selection.
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Carries `registration_token` on the way in; scrubbed on the way out.
    #[serde(default)]
    pub auth: Map<String, Value>,
}

fn default_priority() -> i64 {
    100
}

impl NodeDescriptor {
    /// Parse a descriptor from wire JSON, reporting the first problem as a
    /// plain string suitable for an `E_NODE_REG_INVALID` reply.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let descriptor: Self =
            serde_json::from_value(value.clone()).map_err(|e| format!("invalid descriptor: {e}"))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("node_id must be a non-empty string".to_string());
        }
        if self.node_version.trim().is_empty() {
            return Err("node_version must be a non-empty string".to_string());
        }
        if self.endpoint_url.trim().is_empty() {
            return Err("endpoint_url must be a non-empty string".to_string());
        }
        if self.supported_protocol_versions.is_empty()
            || self
                .supported_protocol_versions
                .iter()
                .any(|v| v.trim().is_empty())
        {
            return Err("supported_protocol_versions must be a non-empty list".to_string());
        }
        if self.capabilities.is_empty() {
            return Err("capabilities must be non-empty".to_string());
        }
        for capability in &self.capabilities {
            capability.validate()?;
        }
        Ok(())
    }

    /// The registration token offered by this descriptor, if any.
    pub fn registration_token(&self) -> Option<&str> {
        self.auth.get("registration_token").and_then(Value::as_str)
    }

    /// The metadata for one claimed capability.
    pub fn capability(&self, intent: &str) -> Option<&CapabilityMetadata> {
        self.capabilities.iter().find(|c| c.name == intent)
    }
}

/// Parse up to three dotted integer components; missing or malformed
/// components read as zero ("1.2" → (1, 2, 0), "2.x.9" → (2, 0, 9)).
pub fn parse_version(version: &str) -> (u64, u64, u64) {
    let mut parts = version
        .split('.')
        .take(3)
        .map(|token| token.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
