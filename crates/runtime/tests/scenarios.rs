//! End-to-end scenarios over the assembled runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, Idempotency, Message, PROTOCOL_VERSION, RiskClass,
    SideEffectScope, looks_like_protocol, make_response, new_uuid,
};
use patchbay_intent::RouteOutcome;
use patchbay_pipeline::PipelineState;
use patchbay_runtime::{Runtime, RuntimeOptions};

const TOKEN: &str = "scenario-test-token";

fn runtime_with_env(extra_env: &[(&str, &str)]) -> (TempDir, Arc<Runtime>) {
    let dir = TempDir::new().unwrap();
    let mut env: HashMap<String, String> = extra_env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.insert("REGISTRATION_TOKEN".to_string(), TOKEN.to_string());

    let runtime = Runtime::new(RuntimeOptions {
        library_root: Some(dir.path().join("library")),
        data_root: Some(dir.path().join("data")),
        env: Some(env),
        user_config_path: Some(PathBuf::from("/nonexistent/config.yaml")),
        registration_token: Some(TOKEN.to_string()),
    })
    .unwrap();
    (dir, runtime)
}

fn runtime() -> (TempDir, Arc<Runtime>) {
    runtime_with_env(&[])
}

fn request(intent: &str, payload: Value) -> Value {
    json!({
        "protocol_version": PROTOCOL_VERSION,
        "message_id": new_uuid(),
        "intent": intent,
        "payload": payload,
    })
}

/// A stub provider used for pinning and selection-order scenarios.
struct StubProvider {
    node_id: String,
    version: String,
    priority: i64,
    capability: String,
    provider: Option<String>,
}

#[async_trait]
impl CapabilityNode for StubProvider {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn node_version(&self) -> &str {
        &self.version
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![CapabilityMetadata {
            name: self.capability.clone(),
            description: "stub provider".to_string(),
            input_schema: json!({"type": "object"}),
            risk_class: RiskClass::Read,
            required_extensions: Vec::new(),
            approval_required: false,
            examples: vec!["stub".to_string()],
            idempotency: Idempotency::Idempotent,
            side_effect_scope: SideEffectScope::External,
            capability_version: "0.1.0".to_string(),
            provider: self.provider.clone(),
        }]
    }

    async fn handle(&self, message: Message) -> Message {
        let mut payload = message.payload.clone();
        payload.insert("handled_by".to_string(), json!(self.node_id));
        if let Some(llm) = message.extension("llm") {
            payload.insert("llm_seen".to_string(), Value::Object(llm.clone()));
            if let Some(provider) = llm.get("provider") {
                payload.insert("provider".to_string(), provider.clone());
            }
        }
        make_response("chat.response", payload, Some(&message.message_id))
    }
}

// S1 — happy chat.
#[tokio::test]
async fn s1_happy_chat() {
    let (_dir, runtime) = runtime();
    let response = runtime
        .route(request("chat.general", json!({"text": "hello"})))
        .await;
    assert_eq!(response.intent, "chat.response");
    assert_eq!(response.payload_str("text"), Some("hello"));

    // Invariant 1: the trace records the router hop and the selected node.
    assert!(response.trace_depth() >= 2);
    let path = response.trace_path();
    assert!(path.contains(&"router.core".to_string()));
    assert!(path.contains(&"interface.cli".to_string()));

    // Invariant 8: every router response is a well-formed protocol message.
    assert!(looks_like_protocol(&serde_json::to_value(&response).unwrap()));
}

// S2 — protected mutation through natural language.
#[tokio::test]
async fn s2_protected_mutation_nl() {
    let (dir, runtime) = runtime();

    let outcome = runtime
        .route_nl("write file notes.md with hello", false, None, None)
        .await;
    match outcome {
        RouteOutcome::RouteError { route_response, .. } => {
            assert_eq!(route_response.error_code(), Some("E_CONFIRMATION_REQUIRED"));
        }
        other => panic!("expected RouteError, got {other:?}"),
    }
    // Fail closed: nothing was written.
    assert!(!dir.path().join("library/notes.md").exists());

    let outcome = runtime
        .route_nl("write file notes.md with hello", true, None, None)
        .await;
    match outcome {
        RouteOutcome::Routed { route_response, .. } => {
            assert_eq!(route_response.intent, "memory.write.applied");
        }
        other => panic!("expected Routed, got {other:?}"),
    }
    assert!(dir.path().join("library/notes.md").exists());
}

// S2 (continued) — the approval flow commits approved writes.
#[tokio::test]
async fn s2_approval_flow_commits() {
    let (dir, runtime) = runtime();
    runtime.bootstrap().await;

    let result = runtime
        .apply_approval_flow(
            json!({
                "intent_being_guarded": "memory.write.propose",
                "changes": [{"path": "finances/notes.md", "summary": "add notes"}],
                "proposed_write": {"path": "finances/notes.md", "content": "budget: 100"},
            }),
            true,
        )
        .await;

    assert_eq!(result["approval_request"]["payload"]["status"], "pending");
    assert_eq!(result["approval_resolve"]["payload"]["status"], "approved");
    assert_eq!(result["write"]["intent"], "memory.write.applied");
    assert_eq!(result["commit"]["intent"], "git.committed");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("library/finances/notes.md")).unwrap(),
        "budget: 100"
    );
}

#[tokio::test]
async fn denied_approval_applies_nothing() {
    let (dir, runtime) = runtime();
    let result = runtime
        .apply_approval_flow(
            json!({
                "intent_being_guarded": "memory.write.propose",
                "changes": ["write notes.md"],
                "proposed_write": {"path": "notes.md", "content": "nope"},
            }),
            false,
        )
        .await;
    assert_eq!(result["approval_resolve"]["payload"]["status"], "denied");
    assert!(result.get("write").is_none());
    assert!(!dir.path().join("library/notes.md").exists());
}

// S3 — provider pinning with disclosure.
#[tokio::test]
async fn s3_provider_pinning() {
    let (_dir, runtime) = runtime_with_env(&[
        ("PATCHBAY_OPENROUTER_API_KEY", "sk-test"),
        ("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "sonnet"),
        ("PATCHBAY_OLLAMA_BASE_URL", "http://localhost:11434/v1"),
        ("PATCHBAY_OLLAMA_DEFAULT_MODEL", "llama3"),
    ]);

    // Stub providers outrank the built-in model nodes so no network I/O
    // happens.
    runtime
        .register_node(Arc::new(StubProvider {
            node_id: "stub.openrouter".to_string(),
            version: "1.0.0".to_string(),
            priority: 500,
            capability: "model.chat.complete".to_string(),
            provider: Some("openrouter".to_string()),
        }))
        .unwrap();
    runtime
        .register_node(Arc::new(StubProvider {
            node_id: "stub.ollama".to_string(),
            version: "1.0.0".to_string(),
            priority: 500,
            capability: "model.chat.complete".to_string(),
            provider: Some("ollama".to_string()),
        }))
        .unwrap();

    let mut value = request("model.chat.complete", json!({"prompt": "hi"}));
    value["extensions"] = json!({"llm": {"provider": "ollama"}});
    let response = runtime.route(value).await;

    assert_eq!(response.payload_str("handled_by"), Some("stub.ollama"));
    assert_eq!(response.payload["provider"], "ollama");
    let llm_seen = &response.payload["llm_seen"];
    assert_eq!(llm_seen["provider"], "ollama");
    assert_eq!(llm_seen["provider_source"], "request override");
    assert_eq!(llm_seen["model"], "llama3");
}

// S4 — duplicate delivery idempotency (via the runtime surface).
#[tokio::test]
async fn s4_duplicate_delivery() {
    let (_dir, runtime) = runtime();
    let value = request("chat.general", json!({"text": "twice"}));
    let ack = runtime.route_async(value.clone()).unwrap();
    runtime.route_async(value).unwrap();

    for _ in 0..400 {
        let settled = runtime
            .status(&ack.message_id)
            .is_some_and(|s| s.state == PipelineState::Completed);
        let duplicated = runtime
            .replay(&ack.message_id)
            .is_some_and(|r| r.events.iter().any(|e| e.event == "duplicate_delivery"));
        if settled && duplicated {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let debug = runtime
        .pipeline()
        .debug_idempotency("interface.cli", &ack.message_id);
    assert_eq!(debug["side_effect_count"], 1);
    assert!(debug["duplicate_event_count"].as_u64().unwrap() >= 1);
    assert_eq!(
        runtime.status(&ack.message_id).unwrap().state,
        PipelineState::Completed
    );
}

// S5 — retries then DLQ.
#[tokio::test]
async fn s5_retries_and_dlq() {
    let (_dir, runtime) = runtime_with_env(&[("RETRY_DELAY_SEC", "0.01")]);
    let value = request("chat.general", json!({"text": "boom", "force_error": true}));
    let ack = runtime.route_async(value).unwrap();

    for _ in 0..400 {
        if runtime
            .status(&ack.message_id)
            .is_some_and(|s| s.state == PipelineState::Dlq)
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let status = runtime.status(&ack.message_id).unwrap();
    assert_eq!(status.state, PipelineState::Dlq);
    let response = status.response.unwrap();
    assert_eq!(response["payload"]["error"]["code"], "E_NODE_TIMEOUT");
}

// S6 — deterministic selection.
#[tokio::test]
async fn s6_deterministic_selection() {
    let (_dir, runtime) = runtime();
    runtime
        .register_node(Arc::new(StubProvider {
            node_id: "z".to_string(),
            version: "1.0.0".to_string(),
            priority: 200,
            capability: "custom.answer".to_string(),
            provider: None,
        }))
        .unwrap();
    runtime
        .register_node(Arc::new(StubProvider {
            node_id: "a".to_string(),
            version: "1.2.0".to_string(),
            priority: 200,
            capability: "custom.answer".to_string(),
            provider: None,
        }))
        .unwrap();

    let response = runtime.route(request("custom.answer", json!({}))).await;
    assert_eq!(response.payload_str("handled_by"), Some("a"));
}

// Invariant 7 — idempotence of folder.list.
#[tokio::test]
async fn folder_list_is_idempotent() {
    let (_dir, runtime) = runtime();
    let first = runtime.route(request("folder.list", json!({}))).await;
    let second = runtime.route(request("folder.list", json!({}))).await;
    assert_eq!(first.payload, second.payload);
}

#[tokio::test]
async fn bootstrap_reports_git_and_provider() {
    let (dir, runtime) = runtime_with_env(&[
        ("PATCHBAY_OPENROUTER_API_KEY", "sk-test"),
        ("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "sonnet"),
    ]);
    let report = runtime.bootstrap().await;
    assert_eq!(report["git"]["intent"], "git.ready");
    let notice = report["provider_notice"].as_str().unwrap();
    assert!(notice.contains("provider=openrouter"));
    assert!(!notice.contains("sk-test"));
    assert!(dir.path().join("library/.git").exists());
}

#[tokio::test]
async fn nl_clarification_for_empty_prompt() {
    let (_dir, runtime) = runtime();
    let plan = runtime.analyze("", None).await;
    assert!(plan.clarification_required);
    assert_eq!(plan.reason_codes, vec!["empty_prompt"]);
    assert!(plan.confidence <= 0.5);
}

#[tokio::test]
async fn registry_surfaces_catalog_and_snapshot() {
    let (_dir, runtime) = runtime();
    let catalog = runtime.catalog();
    assert!(catalog.get("chat.general").is_some());
    assert!(catalog.get("memory.write.propose").is_some());
    assert!(catalog.get("approval.request").is_some());

    let snapshot = runtime.registry_snapshot();
    let nodes = snapshot["nodes"].as_array().unwrap();
    assert!(nodes.len() >= 8);
    assert!(nodes.iter().all(|n| n["status"] == "active"));

    runtime.heartbeat_all();
}
