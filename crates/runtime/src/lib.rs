//! The runtime façade: owns every subsystem and wires the default nodes.
//!
//! Ownership is acyclic: the runtime owns the registry, router, analyzer,
//! pipeline, and stream router; nodes receive a `NodeContext` carrying an
//! injected `route` function reference back into the router.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use patchbay_config::{ConfigResolver, RuntimeSettings};
use patchbay_core::{CapabilityNode, Message, PROTOCOL_VERSION, RouteFn};
use patchbay_intent::{IntentAnalyzer, IntentPlan, RouteOutcome};
use patchbay_nodes::{
    ApprovalGateNode, AuditLogNode, ChatGeneralNode, FolderWorkflowNode, GitOpsNode, MemoryFsNode,
    ModelNode, NodeContext,
};
use patchbay_persistence::{Persistence, PersistenceError, WorkflowState};
use patchbay_pipeline::{AsyncAck, AsyncPipeline, PipelineOptions, ReplayView, StatusEntry, WorkerResult};
use patchbay_registry::{NodeRegistry, RegistryError};
use patchbay_router::{RouterCore, RouterOptions};
use patchbay_stream::StreamRouter;

/// Construction options; environment wins only where options are silent.
/// No `Debug` impl: the env override may carry provider keys.
#[derive(Default, Clone)]
pub struct RuntimeOptions {
    pub library_root: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    /// Environment override (tests); defaults to the process environment.
    pub env: Option<HashMap<String, String>>,
    pub user_config_path: Option<PathBuf>,
    pub registration_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to prepare directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("default node registration failed: {0}")]
    Registration(#[from] RegistryError),
}

struct RegisteredNode {
    lease_token: String,
}

/// The assembled router runtime.
pub struct Runtime {
    settings: RuntimeSettings,
    env: HashMap<String, String>,
    persistence: Arc<Persistence>,
    workflow_state: Arc<WorkflowState>,
    config: Arc<ConfigResolver>,
    router: Arc<RouterCore>,
    intent: IntentAnalyzer,
    pipeline: Arc<AsyncPipeline>,
    stream: Arc<StreamRouter>,
    nodes: Mutex<HashMap<String, RegisteredNode>>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Result<Arc<Self>, RuntimeError> {
        let env: HashMap<String, String> = options
            .env
            .unwrap_or_else(|| std::env::vars().collect());
        let mut settings = RuntimeSettings::from_env(&env);
        if let Some(library_root) = options.library_root {
            settings.library_root = library_root;
        }
        if let Some(data_root) = options.data_root {
            settings.data_root = data_root;
        }
        if let Some(token) = options.registration_token {
            settings.registration_token = token;
        }
        let user_config_path = options.user_config_path.or_else(|| settings.user_config_path.clone());

        std::fs::create_dir_all(&settings.library_root).map_err(|e| RuntimeError::Io {
            path: settings.library_root.display().to_string(),
            source: e,
        })?;

        let persistence = Arc::new(Persistence::new(&settings.data_root)?);
        let workflow_state = Arc::new(WorkflowState::new(persistence.clone()));
        let config = Arc::new(ConfigResolver::new(env.clone(), user_config_path));
        let registry = Arc::new(NodeRegistry::new(
            persistence.clone(),
            settings.registration_token.clone(),
            settings.heartbeat_ttl_sec,
        ));
        let router = Arc::new(RouterCore::new(
            persistence.clone(),
            config.clone(),
            registry.clone(),
            RouterOptions {
                library_root: Some(settings.library_root.clone()),
                node_timeout: std::time::Duration::from_secs_f64(settings.node_timeout_sec),
            },
        ));
        let intent = IntentAnalyzer::new(router.clone());
        let pipeline = AsyncPipeline::new(
            registry,
            persistence.clone(),
            PipelineOptions {
                max_attempts: settings.max_attempts,
                retry_delay: std::time::Duration::from_secs_f64(settings.retry_delay_sec),
                node_timeout: std::time::Duration::from_secs_f64(settings.model_timeout_sec),
            },
        );
        let stream = Arc::new(StreamRouter::new(
            config.clone(),
            persistence.clone(),
            Some(pipeline.clone()),
            settings.clone(),
        ));

        let runtime = Arc::new(Self {
            settings,
            env,
            persistence,
            workflow_state,
            config,
            router,
            intent,
            pipeline,
            stream,
            nodes: Mutex::new(HashMap::new()),
        });
        runtime.register_default_nodes()?;
        Ok(runtime)
    }

    fn node_context(&self) -> NodeContext {
        let router = self.router.clone();
        let route: RouteFn = Arc::new(move |message: Message| {
            let router = router.clone();
            Box::pin(async move { router.route_message(message).await })
        });
        NodeContext {
            library_root: self.settings.library_root.clone(),
            persistence: self.persistence.clone(),
            registration_token: self.settings.registration_token.clone(),
            workflow_state: self.workflow_state.clone(),
            env: self.env.clone(),
            route: Some(route),
        }
    }

    fn register_default_nodes(&self) -> Result<(), RegistryError> {
        let defaults: Vec<Arc<dyn CapabilityNode>> = vec![
            Arc::new(ChatGeneralNode::new(self.node_context())),
            Arc::new(MemoryFsNode::new(self.node_context())),
            Arc::new(FolderWorkflowNode::new(self.node_context())),
            Arc::new(ApprovalGateNode::new(self.node_context())),
            Arc::new(GitOpsNode::new(self.node_context())),
            Arc::new(ModelNode::openrouter(self.node_context())),
            Arc::new(ModelNode::ollama(self.node_context())),
            Arc::new(AuditLogNode::new(self.node_context())),
        ];

        for node in defaults {
            self.register_node(node)?;
        }
        Ok(())
    }

    /// Register an in-process node and remember its lease.
    pub fn register_node(&self, node: Arc<dyn CapabilityNode>) -> Result<(), RegistryError> {
        let descriptor = node.descriptor(&self.settings.registration_token);
        let node_id = descriptor.node_id.clone();
        let ack = self.router.register_node(descriptor, Some(node))?;
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).insert(
            node_id,
            RegisteredNode {
                lease_token: ack.lease_token,
            },
        );
        Ok(())
    }

    /// Refresh every in-process node's lease.
    pub fn heartbeat_all(&self) {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        for (node_id, registered) in nodes.iter() {
            if let Err(e) = self.router.heartbeat(node_id, &registered.lease_token) {
                warn!(node_id = %node_id, error = %e, "Heartbeat failed");
            }
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn workflow_state(&self) -> &Arc<WorkflowState> {
        &self.workflow_state
    }

    pub fn config(&self) -> &Arc<ConfigResolver> {
        &self.config
    }

    pub fn router(&self) -> &Arc<RouterCore> {
        &self.router
    }

    pub fn pipeline(&self) -> &Arc<AsyncPipeline> {
        &self.pipeline
    }

    pub fn stream(&self) -> &Arc<StreamRouter> {
        &self.stream
    }

    /// Route a wire message synchronously.
    pub async fn route(&self, value: Value) -> Message {
        self.router.route(value).await
    }

    /// Enqueue a wire message into the async pipeline.
    pub fn route_async(&self, value: Value) -> Result<AsyncAck, Box<Message>> {
        self.pipeline.route_async(value)
    }

    pub fn apply_worker_result(&self, result: WorkerResult) {
        self.pipeline.apply_worker_result(result);
    }

    pub fn status(&self, message_id: &str) -> Option<StatusEntry> {
        self.pipeline.status(message_id)
    }

    pub fn replay(&self, message_id: &str) -> Option<ReplayView> {
        self.pipeline.replay(message_id)
    }

    /// Analyze free text into an intent plan.
    pub async fn analyze(&self, text: &str, context: Option<&Value>) -> IntentPlan {
        self.intent.analyze(text, context).await
    }

    /// Analyze and route natural language.
    pub async fn route_nl(
        &self,
        text: &str,
        confirm: bool,
        context: Option<&Value>,
        extensions: Option<&Map<String, Value>>,
    ) -> RouteOutcome {
        self.intent.route(text, confirm, context, extensions).await
    }

    fn internal_message(intent: &str, payload: Value) -> Value {
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "message_id": Uuid::new_v4().to_string(),
            "intent": intent,
            "payload": payload,
        })
    }

    /// Startup pass: version-control the library, announce the provider
    /// selection, and start the pipeline's log drain.
    pub async fn bootstrap(&self) -> Value {
        self.pipeline.start_log_drain();

        let git = self
            .route(Self::internal_message("git.init_if_needed", json!({})))
            .await;

        let selection = self.config.select_llm(None);
        let provider_notice = self.config.startup_notice(&selection);
        info!(notice = %provider_notice, "Runtime bootstrapped");

        json!({
            "git": serde_json::to_value(&git).unwrap_or_else(|_| json!({})),
            "provider_notice": provider_notice,
        })
    }

    /// The approval flow: request → resolve → on approval, re-invoke the
    /// guarded mutation with an approved confirmation, then commit the
    /// touched paths.
    pub async fn apply_approval_flow(&self, request_payload: Value, approve: bool) -> Value {
        let request_response = self
            .route(Self::internal_message("approval.request", request_payload.clone()))
            .await;
        if request_response.is_error() {
            return json!({"approval_request": request_response});
        }

        let request_id = request_response
            .payload_str("request_id")
            .unwrap_or_default()
            .to_string();
        let decision = if approve { "approved" } else { "denied" };

        let resolve_response = self
            .route(Self::internal_message(
                "approval.resolve",
                json!({
                    "request_id": request_id,
                    "decision": decision,
                    "decided_by": "owner",
                }),
            ))
            .await;
        if resolve_response.is_error() {
            return json!({
                "approval_request": request_response,
                "approval_resolve": resolve_response,
            });
        }

        let mut out = Map::new();
        out.insert(
            "approval_request".to_string(),
            serde_json::to_value(&request_response).unwrap_or_default(),
        );
        out.insert(
            "approval_resolve".to_string(),
            serde_json::to_value(&resolve_response).unwrap_or_default(),
        );
        if !approve {
            return Value::Object(out);
        }

        let proposed_write = request_payload.get("proposed_write").and_then(Value::as_object);
        let Some(proposed_write) = proposed_write else {
            return Value::Object(out);
        };
        let (Some(path), Some(content)) = (
            proposed_write.get("path").and_then(Value::as_str),
            proposed_write.get("content").and_then(Value::as_str),
        ) else {
            return Value::Object(out);
        };

        let mut write_message = Self::internal_message(
            "memory.write.propose",
            json!({"path": path, "content": content}),
        );
        write_message["extensions"] = json!({
            "confirmation": {
                "required": true,
                "status": "approved",
                "request_id": request_id,
            }
        });
        let write_response = self.route(write_message).await;
        let write_failed = write_response.is_error();
        out.insert(
            "write".to_string(),
            serde_json::to_value(&write_response).unwrap_or_default(),
        );
        if write_failed {
            return Value::Object(out);
        }

        let scope = std::path::Path::new(path)
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "library".to_string());
        let guarded_intent = request_payload
            .get("intent_being_guarded")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let commit_response = self
            .route(Self::internal_message(
                "git.commit.approved_change",
                json!({
                    "paths": [path],
                    "reason": "approved_change",
                    "source_intent": guarded_intent,
                    "approval_request_id": request_id,
                    "commit_message": format!("feat({scope}): approved change"),
                }),
            ))
            .await;
        out.insert(
            "commit".to_string(),
            serde_json::to_value(&commit_response).unwrap_or_default(),
        );

        Value::Object(out)
    }

    /// Catalog and registry projections for the HTTP surfaces.
    pub fn catalog(&self) -> Value {
        serde_json::to_value(self.router.catalog()).unwrap_or_else(|_| json!({}))
    }

    pub fn registry_snapshot(&self) -> Value {
        self.router.registry_snapshot()
    }

    pub fn register_remote(
        &self,
        descriptor: patchbay_core::NodeDescriptor,
    ) -> Result<patchbay_registry::RegisterAck, RegistryError> {
        self.router.register_node(descriptor, None)
    }

    pub fn heartbeat(&self, node_id: &str, lease_token: &str) -> Result<(), RegistryError> {
        self.router.heartbeat(node_id, lease_token)
    }
}
