//! The streaming front-end: synchronous token streams with an async
//! fallback.
//!
//! `complete` answers directly when the prompt is short, or hands the
//! request to the async pipeline (returning a 202-style ack) when the
//! prompt exceeds the threshold or the client forces async. `stream`
//! produces an ordered event sequence — `meta`, then either
//! `async_queued`/`done` or `token`*/`done` — over a channel the transport
//! adapts to SSE. Dropping the receiver aborts the upstream read; stream
//! paths never mutate library state, so nothing is left pending.

mod ollama;
mod target;

pub use ollama::{OllamaChunk, OllamaClient, response_text};
pub use target::{
    Directives, GenerationOptions, NODE_PROFILES, NodeProfile, Target, parse_directives,
    resolve_options, resolve_target,
};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use patchbay_config::{ConfigResolver, PROVIDER_OLLAMA, RuntimeSettings};
use patchbay_core::{
    ErrorCode, Message, PROTOCOL_VERSION, make_error, make_error_with, new_uuid, validate_core,
};
use patchbay_persistence::Persistence;
use patchbay_pipeline::AsyncPipeline;

/// One event of the `/stream` sequence.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Meta(Value),
    AsyncQueued(Value),
    Token { text: String },
    Done(Value),
    Error { code: ErrorCode, message: String, details: Option<Value> },
}

impl StreamEvent {
    /// The SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Meta(_) => "meta",
            Self::AsyncQueued(_) => "async_queued",
            Self::Token { .. } => "token",
            Self::Done(_) => "done",
            Self::Error { .. } => "error",
        }
    }

    /// The SSE data payload.
    pub fn data(&self) -> Value {
        match self {
            Self::Meta(data) | Self::AsyncQueued(data) | Self::Done(data) => data.clone(),
            Self::Token { text } => json!({"text": text}),
            Self::Error { code, message, details } => {
                let mut data = json!({"code": code.as_str(), "message": message});
                if let Some(details) = details {
                    data["details"] = details.clone();
                }
                data
            }
        }
    }
}

/// Outcome of `/complete`.
#[derive(Debug)]
pub enum CompleteOutcome {
    /// Synchronous answer (or error envelope).
    Direct(Box<Message>),
    /// Accepted for async execution; the value is the 202 body.
    Accepted(Value),
}

/// The stream router.
pub struct StreamRouter {
    persistence: Arc<Persistence>,
    pipeline: Option<Arc<AsyncPipeline>>,
    settings: RuntimeSettings,
    ollama: OllamaClient,
    http: reqwest::Client,
}

impl StreamRouter {
    pub fn new(
        config: Arc<ConfigResolver>,
        persistence: Arc<Persistence>,
        pipeline: Option<Arc<AsyncPipeline>>,
        settings: RuntimeSettings,
    ) -> Self {
        // The native API lives beside the OpenAI-compatible `/v1` prefix.
        let base_url = settings
            .ollama_base_url
            .clone()
            .unwrap_or_else(|| {
                let compat = config.provider_defaults(PROVIDER_OLLAMA).base_url;
                compat.trim_end_matches('/').trim_end_matches("/v1").to_string()
            });
        let timeout = Duration::from_secs_f64(settings.model_timeout_sec.max(1.0));
        Self {
            persistence,
            pipeline,
            ollama: OllamaClient::new(base_url, timeout),
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn absolute_url(&self, path_or_url: Option<&str>) -> Option<String> {
        let path = path_or_url?;
        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }
        match &self.settings.async_fallback_status_base {
            Some(base) if path.starts_with('/') => Some(format!("{base}{path}")),
            Some(base) => Some(format!("{base}/{path}")),
            None => Some(path.to_string()),
        }
    }

    /// Whether this request must be handed to the async pipeline, and why.
    pub fn should_async_fallback(&self, message: &Message, target: &Target) -> (bool, &'static str) {
        if !self.settings.async_fallback_enabled {
            return (false, "disabled");
        }

        let mut force_async = message
            .payload
            .get("force_async")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(routing) = message.extension("routing") {
            force_async = force_async
                || routing
                    .get("force_async")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
        }
        if force_async {
            return (true, "forced");
        }

        if target.prompt.len() >= self.settings.async_fallback_min_chars {
            return (true, "prompt_too_long");
        }
        (false, "not_needed")
    }

    /// The canonical async message submitted on fallback. Identity is
    /// preserved when the caller supplied one.
    pub fn build_async_message(&self, original: &Message, target: &Target) -> Value {
        let identity = original
            .extension("identity")
            .cloned()
            .map(Value::Object)
            .unwrap_or_else(|| {
                json!({"actor_id": "user.stream.fallback", "actor_type": "human", "roles": ["user"]})
            });

        json!({
            "protocol_version": PROTOCOL_VERSION,
            "message_id": original.message_id,
            "intent": "model.chat.complete",
            "payload": {
                "prompt": target.prompt,
                "source": "stream_router",
                "route_mode": "async_fallback",
            },
            "extensions": {
                "llm": {
                    "node": target.node,
                    "node_id": target.node_id,
                    "model": target.model,
                    "system_prompt": target.system_prompt,
                },
                "identity": identity,
                "trace": {
                    "parent_message_id": original.message_id,
                    "depth": 1,
                    "path": ["router.async_fallback"],
                },
            },
        })
    }

    /// Queue the request: through the configured remote route URL when
    /// set, otherwise the in-process pipeline.
    async fn queue_async(
        &self,
        message: &Message,
        target: &Target,
        reason: &str,
    ) -> Result<Value, String> {
        let async_message = self.build_async_message(message, target);

        let ack: Value = if let Some(route_url) = &self.settings.async_fallback_route_url {
            let response = self
                .http
                .post(route_url)
                .timeout(Duration::from_secs(20))
                .json(&async_message)
                .send()
                .await
                .map_err(|e| format!("Async fallback request failed: {e}"))?;
            response
                .json()
                .await
                .map_err(|e| format!("Async fallback returned invalid JSON: {e}"))?
        } else if let Some(pipeline) = &self.pipeline {
            let ack = pipeline
                .route_async(async_message)
                .map_err(|err| format!("Async fallback rejected: {:?}", err.error_code()))?;
            serde_json::to_value(ack).map_err(|e| e.to_string())?
        } else {
            return Err("Async fallback is not configured".to_string());
        };

        if !ack.get("accepted").and_then(Value::as_bool).unwrap_or(false) {
            return Err(format!("Async fallback did not accept message: {ack}"));
        }

        Ok(json!({
            "accepted": true,
            "message_id": ack.get("message_id").cloned().unwrap_or_else(|| json!(message.message_id)),
            "correlation_id": ack.get("correlation_id").cloned().unwrap_or_else(|| json!(message.message_id)),
            "status_url": self.absolute_url(ack.get("status_url").and_then(Value::as_str)),
            "replay_url": self.absolute_url(ack.get("replay_url").and_then(Value::as_str)),
            "reason": reason,
            "min_chars": self.settings.async_fallback_min_chars,
        }))
    }

    /// `POST /complete`: direct provider call or 202 ack.
    pub async fn complete(&self, value: Value) -> CompleteOutcome {
        let message = match validate_core(&value) {
            Ok(message) => message,
            Err(err) => return CompleteOutcome::Direct(err),
        };
        let msg_id = message.message_id.clone();
        let target = resolve_target(&message);
        let options = resolve_options(
            &message,
            self.settings.ollama_default_max_tokens,
            &self.settings.ollama_default_stop,
        );

        if target.prompt.is_empty() {
            return CompleteOutcome::Direct(Box::new(make_error(
                ErrorCode::BadMessage,
                "Prompt is empty after directive parsing",
                Some(&msg_id),
            )));
        }

        let (fallback, reason) = self.should_async_fallback(&message, &target);
        if fallback {
            return match self.queue_async(&message, &target, reason).await {
                Ok(ack) => {
                    self.persistence.emit_event(
                        "stream",
                        "complete_async_queued",
                        json!({"message_id": msg_id, "node": target.node, "model": target.model, "reason": reason}),
                    );
                    CompleteOutcome::Accepted(ack)
                }
                Err(error) => {
                    warn!(error = %error, "Async fallback failed");
                    CompleteOutcome::Direct(Box::new(make_error_with(
                        ErrorCode::NodeUnavailable,
                        "Async fallback unavailable",
                        Some(&msg_id),
                        true,
                        json!({"error": error}),
                    )))
                }
            };
        }

        match self.ollama.chat(&target, &options).await {
            Ok(body) => {
                let text = response_text(&body);
                let mut payload = Map::new();
                payload.insert("text".to_string(), json!(text));
                payload.insert("node".to_string(), json!(target.node));
                payload.insert("node_id".to_string(), json!(target.node_id));
                payload.insert("model".to_string(), json!(target.model));
                payload.insert("route_mode".to_string(), json!("direct"));
                payload.insert(
                    "ollama_done_reason".to_string(),
                    body.get("done_reason").cloned().unwrap_or(Value::Null),
                );

                let mut extensions = Map::new();
                if let Some(identity) = message.extension("identity") {
                    extensions.insert("identity".to_string(), Value::Object(identity.clone()));
                }
                extensions.insert(
                    "trace".to_string(),
                    json!({
                        "parent_message_id": msg_id,
                        "depth": 1,
                        "path": ["router.stream.complete", target.node_id],
                    }),
                );

                self.persistence.emit_event(
                    "stream",
                    "complete",
                    json!({
                        "message_id": msg_id,
                        "node": target.node,
                        "node_id": target.node_id,
                        "model": target.model,
                        "max_tokens": options.max_tokens,
                        "stop_count": options.stop.len(),
                        "prompt_preview": preview(&target.prompt),
                        "response_preview": preview(&text),
                    }),
                );

                CompleteOutcome::Direct(Box::new(Message {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    message_id: new_uuid(),
                    intent: "chat_response".to_string(),
                    payload,
                    extensions,
                }))
            }
            Err(e) => {
                self.persistence.emit_event(
                    "stream",
                    "complete_error",
                    json!({"message_id": msg_id, "error": e.to_string()}),
                );
                CompleteOutcome::Direct(Box::new(make_error_with(
                    ErrorCode::NodeUnavailable,
                    "Ollama unavailable",
                    Some(&msg_id),
                    true,
                    json!({"error": e.to_string(), "ollama_base_url": self.ollama.base_url()}),
                )))
            }
        }
    }

    /// `POST /stream`: the ordered event sequence. The error side is a
    /// protocol envelope for requests that fail before streaming starts.
    pub async fn stream(
        self: &Arc<Self>,
        value: Value,
    ) -> Result<mpsc::Receiver<StreamEvent>, Box<Message>> {
        let message = validate_core(&value)?;
        let msg_id = message.message_id.clone();
        let target = resolve_target(&message);
        let options = resolve_options(
            &message,
            self.settings.ollama_default_max_tokens,
            &self.settings.ollama_default_stop,
        );

        if target.prompt.is_empty() {
            return Err(Box::new(make_error(
                ErrorCode::BadMessage,
                "Prompt is empty after directive parsing",
                Some(&msg_id),
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let router = self.clone();
        tokio::spawn(async move {
            router.run_stream(tx, message, target, options).await;
        });
        Ok(rx)
    }

    async fn run_stream(
        &self,
        tx: mpsc::Sender<StreamEvent>,
        message: Message,
        target: Target,
        options: GenerationOptions,
    ) {
        let msg_id = message.message_id.clone();
        let (fallback, reason) = self.should_async_fallback(&message, &target);

        let meta = StreamEvent::Meta(json!({
            "protocol_version": PROTOCOL_VERSION,
            "message_id": msg_id,
            "node": target.node,
            "node_id": target.node_id,
            "model": target.model,
            "async_fallback": fallback,
            "async_reason": reason,
            "max_tokens": options.max_tokens,
            "stop_count": options.stop.len(),
        }));
        if tx.send(meta).await.is_err() {
            self.record_disconnect(&msg_id, &target);
            return;
        }

        if fallback {
            match self.queue_async(&message, &target, reason).await {
                Ok(ack) => {
                    let _ = tx.send(StreamEvent::AsyncQueued(ack)).await;
                    let _ = tx
                        .send(StreamEvent::Done(json!({
                            "message_id": msg_id,
                            "node": target.node,
                            "node_id": target.node_id,
                            "model": target.model,
                            "route_mode": "async_fallback",
                        })))
                        .await;
                    self.persistence.emit_event(
                        "stream",
                        "stream_async_queued",
                        json!({
                            "message_id": msg_id,
                            "node": target.node,
                            "node_id": target.node_id,
                            "model": target.model,
                            "reason": reason,
                        }),
                    );
                }
                Err(error) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            code: ErrorCode::NodeUnavailable,
                            message: "Async fallback unavailable".to_string(),
                            details: Some(json!({"error": error})),
                        })
                        .await;
                }
            }
            return;
        }

        let mut upstream = match self.ollama.chat_stream(&target, &options).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        code: ErrorCode::NodeUnavailable,
                        message: format!("Ollama request failed: {e}"),
                        details: Some(json!({"ollama_base_url": self.ollama.base_url()})),
                    })
                    .await;
                return;
            }
        };

        let mut token_events: u64 = 0;
        let mut output_chars: usize = 0;
        let mut done_payload = Value::Null;

        while let Some(chunk) = upstream.recv().await {
            match chunk {
                OllamaChunk::Token(text) => {
                    token_events += 1;
                    output_chars += text.len();
                    if tx.send(StreamEvent::Token { text }).await.is_err() {
                        self.record_disconnect(&msg_id, &target);
                        return;
                    }
                }
                OllamaChunk::Done(payload) => {
                    done_payload = payload;
                    break;
                }
                OllamaChunk::UpstreamError(error) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            code: ErrorCode::NodeError,
                            message: error,
                            details: Some(json!({"model": target.model})),
                        })
                        .await;
                    return;
                }
                OllamaChunk::Malformed(raw) => {
                    if tx
                        .send(StreamEvent::Error {
                            code: ErrorCode::NodeError,
                            message: "Invalid Ollama stream chunk".to_string(),
                            details: Some(json!({"raw": raw})),
                        })
                        .await
                        .is_err()
                    {
                        self.record_disconnect(&msg_id, &target);
                        return;
                    }
                }
            }
        }

        let done = StreamEvent::Done(json!({
            "message_id": msg_id,
            "node": target.node,
            "node_id": target.node_id,
            "model": target.model,
            "route_mode": "direct",
            "token_events": token_events,
            "output_chars": output_chars,
            "ollama_done_reason": done_payload.get("done_reason").cloned().unwrap_or(Value::Null),
            "max_tokens": options.max_tokens,
            "stop_count": options.stop.len(),
        }));
        if tx.send(done).await.is_err() {
            self.record_disconnect(&msg_id, &target);
            return;
        }

        debug!(message_id = %msg_id, tokens = token_events, "Stream complete");
        self.persistence.emit_event(
            "stream",
            "stream_complete",
            json!({
                "message_id": msg_id,
                "node": target.node,
                "node_id": target.node_id,
                "model": target.model,
                "prompt_preview": preview(&target.prompt),
                "output_chars": output_chars,
                "token_events": token_events,
                "ollama_done_reason": done_payload.get("done_reason").cloned().unwrap_or(Value::Null),
            }),
        );
    }

    fn record_disconnect(&self, message_id: &str, target: &Target) {
        self.persistence.emit_event(
            "stream",
            "client_disconnected",
            json!({"message_id": message_id, "node": target.node, "model": target.model}),
        );
    }
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}
