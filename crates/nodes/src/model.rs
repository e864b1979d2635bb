//! Model capability nodes: OpenAI-compatible chat completion per provider.
//!
//! Both registered providers speak the `/chat/completions` +` /models`
//! surface; what differs is the base URL, key requirements, and the
//! `provider` tag stamped on each capability so the router can pin
//! candidates to the resolved provider.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_error_with, make_response,
};

use crate::{NodeContext, cap, object_schema};

const OLLAMA_FALLBACK_MODELS: &[&str] = &["llama3", "qwen3:8b", "ministral-3:8b"];

/// A provider call failure, carried back to the node for enveloping.
struct CallError {
    code: ErrorCode,
    message: String,
    retryable: bool,
    details: Value,
}

/// One model node per provider.
pub struct ModelNode {
    ctx: NodeContext,
    node_id: &'static str,
    provider: &'static str,
    priority: i64,
    base_url_env: &'static str,
    default_base_url: &'static str,
    api_key_env: &'static str,
    api_key_required: bool,
    http: reqwest::Client,
}

impl ModelNode {
    pub fn openrouter(ctx: NodeContext) -> Self {
        Self::build(
            ctx,
            "node.model.openrouter",
            "openrouter",
            110,
            "PATCHBAY_OPENROUTER_BASE_URL",
            "https://openrouter.ai/api/v1",
            "PATCHBAY_OPENROUTER_API_KEY",
            true,
        )
    }

    pub fn ollama(ctx: NodeContext) -> Self {
        Self::build(
            ctx,
            "node.model.ollama",
            "ollama",
            100,
            "PATCHBAY_OLLAMA_BASE_URL",
            "",
            "PATCHBAY_OLLAMA_API_KEY",
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        ctx: NodeContext,
        node_id: &'static str,
        provider: &'static str,
        priority: i64,
        base_url_env: &'static str,
        default_base_url: &'static str,
        api_key_env: &'static str,
        api_key_required: bool,
    ) -> Self {
        Self {
            ctx,
            node_id,
            provider,
            priority,
            base_url_env,
            default_base_url,
            api_key_env,
            api_key_required,
            http: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> String {
        self.ctx
            .env_value(self.base_url_env)
            .unwrap_or_else(|| self.default_base_url.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    fn api_key(&self) -> Option<String> {
        self.ctx.env_value(self.api_key_env)
    }

    fn timeout(&self) -> Duration {
        let seconds = self
            .ctx
            .env_value("MODEL_TIMEOUT_SEC")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(30.0);
        Duration::from_secs_f64(seconds)
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CallError> {
        let url = format!("{}/{}", self.base_url(), path.trim_start_matches('/'));
        let mut request = self.http.request(method, &url).timeout(self.timeout());
        if let Some(key) = self.api_key() {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(CallError {
                    code: ErrorCode::NodeTimeout,
                    message: format!("{} request timed out. You can retry.", self.provider),
                    retryable: true,
                    details: json!({}),
                });
            }
            Err(e) => {
                return Err(CallError {
                    code: ErrorCode::NodeUnavailable,
                    message: format!(
                        "{} request failed. Check connectivity and {}.",
                        self.provider, self.base_url_env
                    ),
                    retryable: true,
                    details: json!({"reason": e.to_string()}),
                });
            }
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let excerpt: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(320)
                .collect();
            return Err(match status {
                401 | 403 => CallError {
                    code: ErrorCode::NodeUnavailable,
                    message: format!(
                        "{} authentication failed. Check {}.",
                        self.provider, self.api_key_env
                    ),
                    retryable: false,
                    details: json!({"status": status, "upstream": excerpt}),
                },
                404 => CallError {
                    code: ErrorCode::NodeUnavailable,
                    message: format!(
                        "{} endpoint not found. Check {} includes /v1.",
                        self.provider, self.base_url_env
                    ),
                    retryable: false,
                    details: json!({"status": status, "upstream": excerpt}),
                },
                408 | 409 | 429 | 500 | 502 | 503 | 504 => CallError {
                    code: ErrorCode::NodeUnavailable,
                    message: format!(
                        "{} request failed with HTTP {status}. You can retry.",
                        self.provider
                    ),
                    retryable: true,
                    details: json!({"status": status, "upstream": excerpt}),
                },
                _ => CallError {
                    code: ErrorCode::NodeError,
                    message: format!("{} request failed with HTTP {status}.", self.provider),
                    retryable: false,
                    details: json!({"status": status, "upstream": excerpt}),
                },
            });
        }

        response.json().await.map_err(|_| CallError {
            code: ErrorCode::NodeError,
            message: format!("{} returned invalid JSON.", self.provider),
            retryable: false,
            details: json!({}),
        })
    }

    fn content_to_text(content: &Value) -> String {
        match content {
            Value::String(text) => text.trim().to_string(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text.clone()),
                    Value::Object(map) => map
                        .get("text")
                        .or_else(|| map.get("content"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                })
                .collect::<String>()
                .trim()
                .to_string(),
            _ => String::new(),
        }
    }

    fn extract_completion_text(body: &Value) -> String {
        let Some(first) = body.get("choices").and_then(Value::as_array).and_then(|c| c.first())
        else {
            return String::new();
        };
        let from_message = first
            .get("message")
            .and_then(|m| m.get("content"))
            .map(Self::content_to_text)
            .unwrap_or_default();
        if !from_message.is_empty() {
            return from_message;
        }
        first
            .get("delta")
            .and_then(|d| d.get("content"))
            .map(Self::content_to_text)
            .unwrap_or_default()
    }

    async fn chat_completion(&self, model: &str, prompt: &str, llm: &Map<String, Value>) -> Result<String, CallError> {
        let mut body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });
        if let Some(max_tokens) = llm.get("max_tokens").and_then(Value::as_i64).filter(|v| *v > 0) {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = llm.get("temperature").and_then(Value::as_f64) {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = llm.get("top_p").and_then(Value::as_f64) {
            body["top_p"] = json!(top_p);
        }
        match llm.get("stop") {
            Some(Value::String(stop)) if !stop.trim().is_empty() => {
                body["stop"] = json!(stop.trim());
            }
            Some(Value::Array(items)) => {
                let stops: Vec<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if !stops.is_empty() {
                    body["stop"] = json!(stops);
                }
            }
            _ => {}
        }

        debug!(provider = %self.provider, model = %model, "Sending completion request");
        let response = self
            .request_json(reqwest::Method::POST, "/chat/completions", Some(&body))
            .await?;
        let text = Self::extract_completion_text(&response);
        if text.is_empty() {
            return Err(CallError {
                code: ErrorCode::NodeError,
                message: format!("{} response did not include assistant text.", self.provider),
                retryable: false,
                details: json!({"provider": self.provider}),
            });
        }
        Ok(text)
    }

    async fn catalog(&self, parent_id: &str) -> Message {
        let result = self.request_json(reqwest::Method::GET, "/models", None).await;
        let mut models: Vec<String> = Vec::new();
        let fell_back = result.is_err();
        if let Ok(body) = result {
            if let Some(entries) = body.get("data").and_then(Value::as_array) {
                for item in entries {
                    if let Some(id) = item.get("id").and_then(Value::as_str) {
                        let id = id.trim();
                        if !id.is_empty() {
                            models.push(id.to_string());
                        }
                    }
                }
            }
        }
        if models.is_empty() {
            models = OLLAMA_FALLBACK_MODELS.iter().map(|m| m.to_string()).collect();
        } else {
            models.sort();
            models.dedup();
        }

        let mut payload = Map::new();
        payload.insert("provider".to_string(), json!(self.provider));
        payload.insert("models".to_string(), json!(models));
        payload.insert("fallback".to_string(), json!(fell_back));
        make_response("model.catalog", payload, Some(parent_id))
    }
}

#[async_trait]
impl CapabilityNode for ModelNode {
    fn node_id(&self) -> &str {
        self.node_id
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        let with_provider = |mut capability: CapabilityMetadata| {
            capability.provider = Some(self.provider.to_string());
            capability
        };
        vec![
            with_provider(cap(
                "model.chat.complete",
                "Complete a chat prompt with the configured model",
                object_schema(&["prompt"]),
                RiskClass::Read,
                &[],
                false,
                &["ask model to summarize my notes"],
                Idempotency::NonIdempotent,
                SideEffectScope::External,
            )),
            with_provider(cap(
                "model.chat.stream",
                "Stream a chat completion chunk",
                object_schema(&["prompt"]),
                RiskClass::Read,
                &[],
                false,
                &["stream model response"],
                Idempotency::NonIdempotent,
                SideEffectScope::External,
            )),
            with_provider(cap(
                "model.catalog.list",
                "List models offered by the provider",
                object_schema(&[]),
                RiskClass::Read,
                &[],
                false,
                &["list models"],
                Idempotency::Idempotent,
                SideEffectScope::External,
            )),
        ]
    }

    async fn handle(&self, message: Message) -> Message {
        let parent_id = message.message_id.clone();
        let llm = message.llm_extension();
        let model = llm
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();

        // Test hook mirrored from the retry scenarios: force a retryable
        // timeout without a network dependency.
        if message
            .payload
            .get("simulate_timeout")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return make_error_with(
                ErrorCode::NodeTimeout,
                "Request timed out. You can retry.",
                Some(&parent_id),
                true,
                json!({}),
            );
        }

        if self.base_url().is_empty() {
            return make_error(
                ErrorCode::NodeUnavailable,
                &format!("{} is required for provider {}", self.base_url_env, self.provider),
                Some(&parent_id),
            );
        }
        if self.api_key_required && self.api_key().is_none() {
            return make_error(
                ErrorCode::NodeUnavailable,
                &format!("{} is required for provider {}", self.api_key_env, self.provider),
                Some(&parent_id),
            );
        }

        match message.intent.as_str() {
            "model.catalog.list" => self.catalog(&parent_id).await,

            "model.chat.complete" | "model.chat.stream" => {
                let prompt = message.payload_str("prompt").unwrap_or("").trim().to_string();
                if prompt.is_empty() {
                    return make_error(ErrorCode::BadMessage, "prompt is required", Some(&parent_id));
                }
                match self.chat_completion(&model, &prompt, &llm).await {
                    Ok(text) => {
                        let response_intent = if message.intent == "model.chat.stream" {
                            "model.chat.stream.chunk"
                        } else {
                            "model.chat.completed"
                        };
                        let mut payload = Map::new();
                        payload.insert("provider".to_string(), json!(self.provider));
                        payload.insert("model".to_string(), json!(model));
                        payload.insert("text".to_string(), json!(text));
                        make_response(response_intent, payload, Some(&parent_id))
                    }
                    Err(error) => make_error_with(
                        error.code,
                        &error.message,
                        Some(&parent_id),
                        error.retryable,
                        error.details,
                    ),
                }
            }

            _ => make_error(ErrorCode::NoRoute, "Unsupported intent", Some(&parent_id)),
        }
    }
}
