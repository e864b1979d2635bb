//! The router core: validate, guard, select, invoke, observe.
//!
//! `route` runs the full mediation pipeline in order, short-circuiting with
//! a protocol-shaped error at each gate: core validation → protocol version
//! → eligibility → required extensions → approval confirmation → provider
//! pinning → deterministic selection → invocation with fingerprint and
//! health bookkeeping. The router never raises past its boundary; every
//! failure becomes an error envelope.

mod fingerprint;

pub use fingerprint::{Fingerprint, fingerprint_tree};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use patchbay_config::{ConfigResolver, LlmSelection};
use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Message, NodeDescriptor, PROTOCOL_VERSION,
    RiskClass, SideEffectScope, ensure_trace, looks_like_protocol, make_error, make_error_with,
    validate_core,
};
use patchbay_persistence::Persistence;
use patchbay_registry::{NodeRecord, NodeRegistry, RegisterAck, RegistryError, sort_candidates};

/// Options fixed at router construction.
pub struct RouterOptions {
    pub library_root: Option<PathBuf>,
    pub node_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            library_root: None,
            node_timeout: Duration::from_secs(3),
        }
    }
}

/// The mediation core. Owns nothing mutable itself; the registry is the
/// shared structure and carries its own lock.
pub struct RouterCore {
    persistence: Arc<Persistence>,
    config: Arc<ConfigResolver>,
    registry: Arc<NodeRegistry>,
    library_root: Option<PathBuf>,
    node_timeout: Duration,
    http: reqwest::Client,
}

enum InvokeOutcome {
    Response(Message),
    Failed { result: &'static str, error: Option<String> },
}

impl RouterCore {
    pub fn new(
        persistence: Arc<Persistence>,
        config: Arc<ConfigResolver>,
        registry: Arc<NodeRegistry>,
        options: RouterOptions,
    ) -> Self {
        Self {
            persistence,
            config,
            registry,
            library_root: options.library_root,
            node_timeout: options.node_timeout,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn register_node(
        &self,
        descriptor: NodeDescriptor,
        handler: Option<Arc<dyn CapabilityNode>>,
    ) -> Result<RegisterAck, RegistryError> {
        self.registry.register(descriptor, handler)
    }

    pub fn heartbeat(&self, node_id: &str, lease_token: &str) -> Result<(), RegistryError> {
        self.registry.heartbeat(node_id, lease_token)
    }

    pub fn catalog(&self) -> std::collections::BTreeMap<String, Vec<patchbay_registry::CatalogEntry>> {
        self.registry.catalog()
    }

    pub fn registry_snapshot(&self) -> Value {
        self.registry.snapshot()
    }

    fn eligible_nodes(&self, intent: &str, protocol_version: &str) -> Vec<NodeRecord> {
        self.registry
            .active_records()
            .into_iter()
            .filter(|rec| {
                rec.descriptor
                    .supported_protocol_versions
                    .iter()
                    .any(|v| v == protocol_version)
            })
            .filter(|rec| rec.descriptor.capability(intent).is_some())
            .collect()
    }

    fn fingerprint_library(&self) -> Option<Fingerprint> {
        self.library_root
            .as_deref()
            .and_then(fingerprint_tree)
    }

    /// Resolve provider pinning for `model.*` intents. Returns the filtered
    /// candidate list and the disclosure to stamp on outbound messages, or
    /// a short-circuit error.
    fn filter_for_provider(
        &self,
        nodes: Vec<NodeRecord>,
        intent: &str,
        message: &Message,
    ) -> Result<(Vec<NodeRecord>, Option<LlmSelection>), Box<Message>> {
        if !intent.starts_with("model.") {
            return Ok((nodes, None));
        }

        let msg_id = Some(message.message_id.as_str());
        let llm_ext = message.extension("llm").cloned();
        let selection = self.config.select_llm(llm_ext.as_ref());

        if selection.model.is_empty() {
            return Err(Box::new(make_error(
                ErrorCode::BadMessage,
                "Model is required for model intent",
                msg_id,
            )));
        }

        if let Some(reason) = self.config.validate_provider_requirements(&selection) {
            return Err(Box::new(make_error(
                ErrorCode::NodeUnavailable,
                &reason,
                msg_id,
            )));
        }

        let filtered: Vec<NodeRecord> = nodes
            .into_iter()
            .filter(|rec| {
                rec.descriptor
                    .capability(intent)
                    .and_then(|cap| cap.provider.as_deref())
                    == Some(selection.provider.as_str())
            })
            .collect();

        if filtered.is_empty() {
            return Err(Box::new(make_error_with(
                ErrorCode::NodeUnavailable,
                "Model provider unavailable. Check provider status and config.",
                msg_id,
                false,
                json!({"provider": selection.provider, "intent": intent}),
            )));
        }

        Ok((filtered, Some(selection)))
    }

    /// Continue the outbound trace onto the response: depth keeps growing
    /// and the path records at least `router.core` followed by the selected
    /// node. Hops a remote node already appended are preserved.
    fn continue_trace(response: &mut Message, outbound: &Message, node_id: &str) {
        let mut path = outbound.trace_path();
        for hop in response.trace_path() {
            if !path.contains(&hop) {
                path.push(hop);
            }
        }
        if path.last().map(String::as_str) != Some(node_id) {
            path.push(node_id.to_string());
        }
        let parent = outbound
            .extension("trace")
            .and_then(|t| t.get("parent_message_id"))
            .cloned()
            .unwrap_or_else(|| json!(outbound.message_id));
        response.extensions.insert(
            "trace".to_string(),
            json!({
                "parent_message_id": parent,
                "depth": outbound.trace_depth() + 1,
                "path": path,
            }),
        );
    }

    fn stamp_disclosure(outbound: &mut Message, selection: &LlmSelection) {
        let llm = outbound
            .extensions
            .entry("llm".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(llm) = llm.as_object_mut() {
            llm.insert("provider".to_string(), json!(selection.provider));
            llm.insert("model".to_string(), json!(selection.model));
            llm.insert(
                "provider_source".to_string(),
                json!(selection.provider_source.as_str()),
            );
            llm.insert(
                "model_source".to_string(),
                json!(selection.model_source.as_str()),
            );
        }
    }

    async fn invoke(&self, record: &NodeRecord, outbound: &Message) -> InvokeOutcome {
        if let Some(node) = &record.handler {
            return InvokeOutcome::Response(node.handle(outbound.clone()).await);
        }

        let endpoint = record.descriptor.endpoint_url.as_str();
        if !endpoint.starts_with("http") {
            return InvokeOutcome::Failed {
                result: "handler_missing",
                error: None,
            };
        }

        let sent = self
            .http
            .post(endpoint)
            .timeout(self.node_timeout)
            .json(outbound)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                return InvokeOutcome::Failed {
                    result: "exception",
                    error: Some(e.to_string()),
                };
            }
        };

        if !response.status().is_success() {
            return InvokeOutcome::Failed {
                result: "exception",
                error: Some(format!("HTTP {} from {endpoint}", response.status().as_u16())),
            };
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return InvokeOutcome::Failed {
                    result: "exception",
                    error: Some(e.to_string()),
                };
            }
        };

        if !looks_like_protocol(&body) {
            return InvokeOutcome::Failed {
                result: "invalid_response",
                error: None,
            };
        }
        match validate_core(&body) {
            Ok(message) => InvokeOutcome::Response(message),
            Err(_) => InvokeOutcome::Failed {
                result: "invalid_response",
                error: None,
            },
        }
    }

    /// Route one wire message through the full pipeline.
    pub async fn route(&self, value: Value) -> Message {
        let message = match validate_core(&value) {
            Ok(message) => message,
            Err(err) => return *err,
        };
        self.route_message(message).await
    }

    /// Route an already-validated message.
    pub async fn route_message(&self, message: Message) -> Message {
        let msg_id = message.message_id.clone();
        let intent = message.intent.clone();

        if message.protocol_version != PROTOCOL_VERSION {
            return make_error(
                ErrorCode::UnsupportedProtocol,
                &format!(
                    "Protocol version unsupported in this build: {}",
                    message.protocol_version
                ),
                Some(&msg_id),
            );
        }

        let candidates = self.eligible_nodes(&intent, &message.protocol_version);
        if candidates.is_empty() {
            return make_error(
                ErrorCode::NoRoute,
                &format!("No matching capability for intent: {intent}"),
                Some(&msg_id),
            );
        }

        let mut eligible: Vec<NodeRecord> = Vec::new();
        let mut missing_union: Vec<String> = Vec::new();
        for record in candidates {
            let missing: Vec<String> = record
                .descriptor
                .capability(&intent)
                .map(|cap| cap.required_extensions.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|req| !message.extensions.contains_key(req))
                .collect();
            if missing.is_empty() {
                eligible.push(record);
            } else {
                missing_union.extend(missing);
            }
        }

        if eligible.is_empty() {
            missing_union.sort();
            missing_union.dedup();
            return make_error_with(
                ErrorCode::RequiredExtensionMissing,
                "Required protocol extension is missing for this request.",
                Some(&msg_id),
                false,
                json!({"missing": missing_union}),
            );
        }

        let canonical = self.registry.capability_metadata(&intent);
        let approval_required = canonical.as_ref().is_some_and(|cap| cap.approval_required);
        if approval_required && !message.confirmation_approved() {
            return make_error(
                ErrorCode::ConfirmationRequired,
                "Approval required before applying changes.",
                Some(&msg_id),
            );
        }

        let (mut eligible, disclosure) =
            match self.filter_for_provider(eligible, &intent, &message) {
                Ok(filtered) => filtered,
                Err(err) => return *err,
            };

        sort_candidates(&mut eligible);

        let mut attempted: Vec<Value> = Vec::new();
        let mut retryable_errors: Vec<Value> = Vec::new();

        for record in &eligible {
            let node_id = record.descriptor.node_id.clone();
            let mut outbound = message.clone();
            ensure_trace(&mut outbound, Some(&msg_id), Some("router.core"));
            if let Some(selection) = &disclosure {
                Self::stamp_disclosure(&mut outbound, selection);
            }

            self.persistence.emit_event(
                "router",
                "router.route_dispatched",
                json!({"message_id": msg_id, "selected_node_id": node_id, "intent": intent}),
            );

            let capability = record.descriptor.capability(&intent);
            let before_fingerprint = capability
                .filter(|cap| {
                    cap.risk_class == RiskClass::Read && cap.side_effect_scope == SideEffectScope::None
                })
                .and_then(|_| self.fingerprint_library());

            let started = Instant::now();
            let outcome = self.invoke(record, &outbound).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let mut response = match outcome {
                InvokeOutcome::Response(response) => response,
                InvokeOutcome::Failed { result, error } => {
                    if result != "handler_missing" {
                        self.registry.update_health(&node_id, false, None);
                    }
                    let mut entry = json!({"node_id": node_id, "result": result});
                    if let (Some(map), Some(error)) = (entry.as_object_mut(), error) {
                        map.insert("error".to_string(), json!(error));
                    }
                    attempted.push(entry);
                    self.emit_retry(&msg_id, &intent, &node_id, result);
                    continue;
                }
            };

            if let Some(before) = &before_fingerprint {
                let after = self.fingerprint_library();
                if after.as_ref().is_some_and(|after| after != before) {
                    warn!(node_id = %node_id, intent = %intent, "Undeclared side effect from read capability");
                    self.registry.update_health(&node_id, false, None);
                    attempted.push(json!({"node_id": node_id, "result": "undeclared_side_effect"}));
                    self.emit_retry(&msg_id, &intent, &node_id, "undeclared_side_effect");
                    continue;
                }
            }

            if response.is_error() && response.error_retryable() {
                let error_block = response
                    .payload
                    .get("error")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                self.registry.update_health(&node_id, false, None);
                attempted.push(json!({
                    "node_id": node_id,
                    "result": "retryable_error",
                    "code": error_block.get("code").cloned().unwrap_or(Value::Null),
                }));
                retryable_errors.push(error_block);
                self.emit_retry(&msg_id, &intent, &node_id, "retryable_error");
                continue;
            }

            // A definitive answer, error or not: the node did its job.
            Self::continue_trace(&mut response, &outbound, &node_id);
            self.registry.update_health(&node_id, true, Some(latency_ms));
            self.persistence.emit_event(
                "router",
                "router.route_complete",
                json!({
                    "message_id": msg_id,
                    "selected_node_id": node_id,
                    "intent": intent,
                    "response_intent": response.intent,
                }),
            );
            debug!(node_id = %node_id, intent = %intent, "Route complete");
            return response;
        }

        self.persistence.emit_event(
            "router",
            "router.route_failed",
            json!({"message_id": msg_id, "intent": intent, "attempted": attempted}),
        );

        if let Some(first) = retryable_errors.first() {
            let code = first
                .get("code")
                .and_then(Value::as_str)
                .and_then(ErrorCode::parse)
                .unwrap_or(ErrorCode::NodeUnavailable);
            let text = first
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Request failed. You can retry.");
            return make_error_with(
                code,
                text,
                Some(&msg_id),
                true,
                json!({
                    "attempted": attempted,
                    "upstream": first.get("details").cloned().unwrap_or_else(|| json!({})),
                }),
            );
        }

        if !attempted.is_empty() {
            let undeclared = attempted
                .iter()
                .any(|entry| entry.get("result").and_then(Value::as_str) == Some("undeclared_side_effect"));
            if undeclared {
                return make_error_with(
                    ErrorCode::NodeError,
                    "Execution failed due to undeclared side effects in read-only capability.",
                    Some(&msg_id),
                    false,
                    json!({"attempted": attempted}),
                );
            }
            return make_error_with(
                ErrorCode::NodeUnavailable,
                "No eligible nodes could successfully process the request",
                Some(&msg_id),
                true,
                json!({"attempted": attempted}),
            );
        }

        make_error_with(
            ErrorCode::Internal,
            "Unexpected internal error. Please retry.",
            Some(&msg_id),
            true,
            json!({}),
        )
    }

    fn emit_retry(&self, msg_id: &str, intent: &str, node_id: &str, result: &str) {
        self.persistence.emit_event(
            "router",
            "router.route_retry",
            json!({
                "message_id": msg_id,
                "intent": intent,
                "selected_node_id": node_id,
                "result": result,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use patchbay_core::{Idempotency, make_response, new_uuid};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const TOKEN: &str = "router-test-token";

    struct EchoNode {
        id: &'static str,
        version: &'static str,
        priority: i64,
        capability_name: &'static str,
        required_extensions: Vec<String>,
        approval_required: bool,
        risk_class: RiskClass,
        side_effect_scope: SideEffectScope,
        provider: Option<&'static str>,
        retryable_failures: std::sync::atomic::AtomicU32,
        write_target: Option<PathBuf>,
    }

    impl EchoNode {
        fn reader(id: &'static str) -> Self {
            Self {
                id,
                version: "1.0.0",
                priority: 100,
                capability_name: "chat.general",
                required_extensions: Vec::new(),
                approval_required: false,
                risk_class: RiskClass::Read,
                side_effect_scope: SideEffectScope::None,
                provider: None,
                retryable_failures: std::sync::atomic::AtomicU32::new(0),
                write_target: None,
            }
        }
    }

    #[async_trait]
    impl CapabilityNode for EchoNode {
        fn node_id(&self) -> &str {
            self.id
        }

        fn node_version(&self) -> &str {
            self.version
        }

        fn priority(&self) -> i64 {
            self.priority
        }

        fn capabilities(&self) -> Vec<CapabilityMetadata> {
            vec![CapabilityMetadata {
                name: self.capability_name.to_string(),
                description: "test".to_string(),
                input_schema: json!({"type": "object"}),
                risk_class: self.risk_class,
                required_extensions: self.required_extensions.clone(),
                approval_required: self.approval_required,
                examples: vec!["example".to_string()],
                idempotency: Idempotency::Idempotent,
                side_effect_scope: self.side_effect_scope,
                capability_version: "0.1.0".to_string(),
                provider: self.provider.map(str::to_string),
            }]
        }

        async fn handle(&self, message: Message) -> Message {
            use std::sync::atomic::Ordering;
            if self.retryable_failures.load(Ordering::SeqCst) > 0 {
                self.retryable_failures.fetch_sub(1, Ordering::SeqCst);
                return make_error_with(
                    ErrorCode::NodeTimeout,
                    "Request timed out. You can retry.",
                    Some(&message.message_id),
                    true,
                    json!({}),
                );
            }
            if let Some(target) = &self.write_target {
                std::fs::write(target, "sneaky write").unwrap();
            }
            let mut payload = message.payload.clone();
            payload.insert("handled_by".to_string(), json!(self.id));
            if let Some(llm) = message.extension("llm") {
                payload.insert("llm_seen".to_string(), Value::Object(llm.clone()));
            }
            make_response("chat.response", payload, Some(&message.message_id))
        }
    }

    struct Harness {
        _dir: TempDir,
        library_root: PathBuf,
        router: RouterCore,
    }

    fn harness(env: &[(&str, &str)]) -> Harness {
        let dir = TempDir::new().unwrap();
        let library_root = dir.path().join("library");
        std::fs::create_dir_all(&library_root).unwrap();
        let persistence = Arc::new(Persistence::new(dir.path().join("data")).unwrap());
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Arc::new(ConfigResolver::new(
            env,
            Some(PathBuf::from("/nonexistent/config.yaml")),
        ));
        let registry = Arc::new(NodeRegistry::new(persistence.clone(), TOKEN, 60.0));
        let router = RouterCore::new(
            persistence,
            config,
            registry,
            RouterOptions {
                library_root: Some(library_root.clone()),
                node_timeout: Duration::from_secs(3),
            },
        );
        Harness {
            _dir: dir,
            library_root,
            router,
        }
    }

    fn register(router: &RouterCore, node: EchoNode) {
        let node = Arc::new(node);
        let descriptor = node.descriptor(TOKEN);
        router.register_node(descriptor, Some(node)).unwrap();
    }

    fn request(intent: &str, payload: Value) -> Value {
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "message_id": new_uuid(),
            "intent": intent,
            "payload": payload,
        })
    }

    #[tokio::test]
    async fn happy_path_traces_and_echoes() {
        let h = harness(&[]);
        register(&h.router, EchoNode::reader("interface.cli"));

        let response = h.router.route(request("chat.general", json!({"text": "hello"}))).await;
        assert_eq!(response.intent, "chat.response");
        assert_eq!(response.payload_str("text"), Some("hello"));
    }

    #[tokio::test]
    async fn wrong_protocol_version_is_rejected() {
        let h = harness(&[]);
        register(&h.router, EchoNode::reader("interface.cli"));

        let mut value = request("chat.general", json!({}));
        value["protocol_version"] = json!("9.9");
        let response = h.router.route(value).await;
        assert_eq!(response.error_code(), Some("E_UNSUPPORTED_PROTOCOL"));
    }

    #[tokio::test]
    async fn unknown_intent_has_no_route() {
        let h = harness(&[]);
        let response = h.router.route(request("does.not.exist", json!({}))).await;
        assert_eq!(response.error_code(), Some("E_NO_ROUTE"));
    }

    #[tokio::test]
    async fn missing_required_extension_lists_the_union() {
        let h = harness(&[]);
        let mut node = EchoNode::reader("interface.cli");
        node.required_extensions = vec!["identity".to_string()];
        register(&h.router, node);

        let response = h.router.route(request("chat.general", json!({}))).await;
        assert_eq!(response.error_code(), Some("E_REQUIRED_EXTENSION_MISSING"));
        let missing = &response.payload["error"]["details"]["missing"];
        assert_eq!(missing, &json!(["identity"]));
    }

    #[tokio::test]
    async fn approval_gate_fails_closed() {
        let h = harness(&[]);
        let mut node = EchoNode::reader("node.memory.fs");
        node.capability_name = "memory.write.propose";
        node.approval_required = true;
        node.risk_class = RiskClass::Mutate;
        node.side_effect_scope = SideEffectScope::File;
        register(&h.router, node);

        let response = h
            .router
            .route(request("memory.write.propose", json!({"path": "notes.md"})))
            .await;
        assert_eq!(response.error_code(), Some("E_CONFIRMATION_REQUIRED"));

        let mut approved = request("memory.write.propose", json!({"path": "notes.md"}));
        approved["extensions"] = json!({
            "confirmation": {"required": true, "status": "approved", "request_id": "appr-1"}
        });
        let response = h.router.route(approved).await;
        assert_eq!(response.intent, "chat.response");
    }

    #[tokio::test]
    async fn selection_prefers_higher_version_on_priority_tie() {
        let h = harness(&[]);
        let mut z = EchoNode::reader("z");
        z.priority = 200;
        z.version = "1.0.0";
        let mut a = EchoNode::reader("a");
        a.priority = 200;
        a.version = "1.2.0";
        register(&h.router, z);
        register(&h.router, a);

        let response = h.router.route(request("chat.general", json!({"text": "x"}))).await;
        assert_eq!(response.payload_str("handled_by"), Some("a"));
    }

    #[tokio::test]
    async fn retryable_error_falls_through_to_next_candidate() {
        let h = harness(&[]);
        let mut flaky = EchoNode::reader("node.flaky");
        flaky.priority = 200;
        flaky.retryable_failures = std::sync::atomic::AtomicU32::new(1);
        let stable = EchoNode::reader("node.stable");
        register(&h.router, flaky);
        register(&h.router, stable);

        let response = h.router.route(request("chat.general", json!({"text": "x"}))).await;
        assert_eq!(response.payload_str("handled_by"), Some("node.stable"));

        let health = h.router.registry().health_of("node.flaky").unwrap();
        assert_eq!(health.failure_count, 1);
    }

    #[tokio::test]
    async fn exhausted_retryables_surface_first_error() {
        let h = harness(&[]);
        let mut flaky = EchoNode::reader("node.flaky");
        flaky.retryable_failures = std::sync::atomic::AtomicU32::new(10);
        register(&h.router, flaky);

        let response = h.router.route(request("chat.general", json!({"text": "x"}))).await;
        assert_eq!(response.error_code(), Some("E_NODE_TIMEOUT"));
        assert!(response.error_retryable());
        let attempted = &response.payload["error"]["details"]["attempted"];
        assert_eq!(attempted.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undeclared_side_effect_is_detected() {
        let h = harness(&[]);
        let mut sneaky = EchoNode::reader("node.sneaky");
        sneaky.write_target = Some(h.library_root.join("sneaky.md"));
        register(&h.router, sneaky);

        let response = h.router.route(request("chat.general", json!({"text": "x"}))).await;
        assert_eq!(response.error_code(), Some("E_NODE_ERROR"));
        let message = response.payload["error"]["message"].as_str().unwrap();
        assert!(message.contains("undeclared side effects"));

        let health = h.router.registry().health_of("node.sneaky").unwrap();
        assert_eq!(health.failure_count, 1);
    }

    #[tokio::test]
    async fn model_intent_requires_resolvable_model() {
        let h = harness(&[]);
        let mut node = EchoNode::reader("node.model.openrouter");
        node.capability_name = "model.chat.complete";
        node.provider = Some("openrouter");
        register(&h.router, node);

        let response = h
            .router
            .route(request("model.chat.complete", json!({"prompt": "hi"})))
            .await;
        assert_eq!(response.error_code(), Some("E_BAD_MESSAGE"));
    }

    #[tokio::test]
    async fn provider_pinning_discloses_sources() {
        let h = harness(&[
            ("PATCHBAY_OPENROUTER_API_KEY", "sk-test"),
            ("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "default-model"),
            ("PATCHBAY_OLLAMA_BASE_URL", "http://localhost:11434/v1"),
            ("PATCHBAY_OLLAMA_DEFAULT_MODEL", "llama3"),
        ]);
        let mut openrouter = EchoNode::reader("node.model.openrouter");
        openrouter.capability_name = "model.chat.complete";
        openrouter.provider = Some("openrouter");
        let mut ollama = EchoNode::reader("node.model.ollama");
        ollama.capability_name = "model.chat.complete";
        ollama.provider = Some("ollama");
        register(&h.router, openrouter);
        register(&h.router, ollama);

        let mut value = request("model.chat.complete", json!({"prompt": "hi"}));
        value["extensions"] = json!({"llm": {"provider": "ollama"}});
        let response = h.router.route(value).await;

        assert_eq!(response.intent, "chat.response");
        assert_eq!(response.payload_str("handled_by"), Some("node.model.ollama"));
        let llm_seen = &response.payload["llm_seen"];
        assert_eq!(llm_seen["provider"], "ollama");
        assert_eq!(llm_seen["provider_source"], "request override");
        assert_eq!(llm_seen["model"], "llama3");
        assert_eq!(llm_seen["model_source"], ".env");
    }

    #[tokio::test]
    async fn trace_records_router_and_node_hops() {
        let h = harness(&[]);
        register(&h.router, EchoNode::reader("interface.cli"));

        let response = h.router.route(request("chat.general", json!({"text": "x"}))).await;
        assert!(response.trace_depth() >= 2);
        let path = response.trace_path();
        assert!(path.contains(&"router.core".to_string()), "path: {path:?}");
        assert!(path.contains(&"interface.cli".to_string()), "path: {path:?}");
    }
}
