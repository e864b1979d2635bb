//! HTTP surfaces for the router core.
//!
//! The gateway is a thin adapter: every endpoint delegates to the runtime
//! and the wire contract is the protocol `Message` (or the small JSON
//! shapes of the registration, status, and intent surfaces). Built on Axum
//! like the rest of the HTTP stack.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use patchbay_core::{ErrorCode, NodeDescriptor, make_error};
use patchbay_pipeline::WorkerResult;
use patchbay_runtime::Runtime;
use patchbay_stream::CompleteOutcome;

pub type SharedRuntime = Arc<Runtime>;

/// Build the gateway router over a shared runtime.
pub fn build_router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/router/catalog", get(catalog_handler))
        .route("/router/registry", get(registry_handler))
        .route("/router/node/register", post(register_handler))
        .route("/router/node/heartbeat", post(heartbeat_handler))
        .route("/route", post(route_handler))
        .route("/route_async", post(route_async_handler))
        .route("/worker_result", post(worker_result_handler))
        .route("/status/{id}", get(status_handler))
        .route("/replay/{id}", get(replay_handler))
        .route("/intent/analyze", post(intent_analyze_handler))
        .route("/intent/route", post(intent_route_handler))
        .route("/complete", post(complete_handler))
        .route("/stream", post(stream_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Serve until the listener fails.
pub async fn serve(runtime: SharedRuntime, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(runtime);
    let addr = format!("{host}:{port}");
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}

/// Parse a protocol-surface body; syntactically invalid JSON becomes a
/// fresh `E_BAD_MESSAGE` envelope rather than a bare 400.
fn parse_body(body: &str) -> Result<Value, Box<Value>> {
    serde_json::from_str(body).map_err(|_| {
        let envelope = make_error(ErrorCode::BadMessage, "Invalid JSON body", None);
        Box::new(serde_json::to_value(envelope).unwrap_or_else(|_| json!({})))
    })
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "ok": true,
        "service": "patchbay-router",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn catalog_handler(State(runtime): State<SharedRuntime>) -> Json<Value> {
    Json(json!({"ok": true, "catalog": runtime.catalog()}))
}

async fn registry_handler(State(runtime): State<SharedRuntime>) -> Json<Value> {
    let snapshot = runtime.registry_snapshot();
    Json(json!({"ok": true, "nodes": snapshot.get("nodes").cloned().unwrap_or_else(|| json!([]))}))
}

async fn register_handler(
    State(runtime): State<SharedRuntime>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let descriptor = match NodeDescriptor::from_value(&body) {
        Ok(descriptor) => descriptor,
        Err(error) => {
            return Json(json!({
                "ok": false,
                "code": ErrorCode::NodeRegInvalid.as_str(),
                "error": error,
            }));
        }
    };
    match runtime.register_remote(descriptor) {
        Ok(ack) => Json(json!({
            "ok": true,
            "node_id": ack.node_id,
            "lease_token": ack.lease_token,
            "heartbeat_ttl_sec": ack.heartbeat_ttl_sec,
        })),
        Err(e) => Json(json!({
            "ok": false,
            "code": e.code().as_str(),
            "error": e.to_string(),
        })),
    }
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    node_id: String,
    lease_token: String,
}

async fn heartbeat_handler(
    State(runtime): State<SharedRuntime>,
    Json(body): Json<HeartbeatRequest>,
) -> Response {
    match runtime.heartbeat(&body.node_id, &body.lease_token) {
        Ok(()) => Json(json!({"ok": true, "node_id": body.node_id})).into_response(),
        Err(e) if e.code() == ErrorCode::NodeNotRegistered => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "code": e.code().as_str(), "error": e.to_string()})),
        )
            .into_response(),
        Err(e) => Json(json!({"ok": false, "code": e.code().as_str(), "error": e.to_string()}))
            .into_response(),
    }
}

async fn route_handler(State(runtime): State<SharedRuntime>, body: String) -> Json<Value> {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(envelope) => return Json(*envelope),
    };
    let response = runtime.route(value).await;
    Json(serde_json::to_value(response).unwrap_or_else(|_| json!({})))
}

async fn route_async_handler(State(runtime): State<SharedRuntime>, body: String) -> Response {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(envelope) => return Json(*envelope).into_response(),
    };
    match runtime.route_async(value) {
        Ok(ack) => (
            StatusCode::ACCEPTED,
            Json(serde_json::to_value(ack).unwrap_or_else(|_| json!({}))),
        )
            .into_response(),
        Err(err) => Json(serde_json::to_value(*err).unwrap_or_else(|_| json!({}))).into_response(),
    }
}

async fn worker_result_handler(
    State(runtime): State<SharedRuntime>,
    Json(body): Json<WorkerResult>,
) -> Json<Value> {
    if body.message_id.is_empty() {
        return Json(json!({"ok": false, "error": "missing_message_id"}));
    }
    runtime.apply_worker_result(body);
    Json(json!({"ok": true}))
}

async fn status_handler(
    State(runtime): State<SharedRuntime>,
    Path(message_id): Path<String>,
) -> Response {
    match runtime.status(&message_id) {
        Some(status) => Json(json!({
            "ok": true,
            "message_id": message_id,
            "status": serde_json::to_value(status).unwrap_or_else(|_| json!({})),
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "not_found", "message_id": message_id})),
        )
            .into_response(),
    }
}

async fn replay_handler(
    State(runtime): State<SharedRuntime>,
    Path(message_id): Path<String>,
) -> Response {
    match runtime.replay(&message_id) {
        Some(replay) => {
            let mut body = serde_json::to_value(replay).unwrap_or_else(|_| json!({}));
            if let Some(map) = body.as_object_mut() {
                map.insert("ok".to_string(), json!(true));
            }
            Json(body).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "not_found", "message_id": message_id})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct IntentAnalyzeRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    context: Option<Value>,
}

async fn intent_analyze_handler(
    State(runtime): State<SharedRuntime>,
    Json(body): Json<IntentAnalyzeRequest>,
) -> Json<Value> {
    let analysis = runtime.analyze(&body.message, body.context.as_ref()).await;
    Json(json!({
        "ok": true,
        "analysis": serde_json::to_value(analysis).unwrap_or_else(|_| json!({})),
    }))
}

#[derive(Deserialize)]
struct IntentRouteRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    extensions: Option<Map<String, Value>>,
}

async fn intent_route_handler(
    State(runtime): State<SharedRuntime>,
    Json(body): Json<IntentRouteRequest>,
) -> Json<Value> {
    let outcome = runtime
        .route_nl(
            &body.message,
            body.confirm,
            body.context.as_ref(),
            body.extensions.as_ref(),
        )
        .await;
    let mut value = serde_json::to_value(outcome).unwrap_or_else(|_| json!({}));
    if let Some(map) = value.as_object_mut() {
        map.insert("ok".to_string(), json!(true));
    }
    Json(value)
}

async fn complete_handler(State(runtime): State<SharedRuntime>, body: String) -> Response {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(envelope) => return Json(*envelope).into_response(),
    };
    match runtime.stream().complete(value).await {
        CompleteOutcome::Direct(message) => {
            Json(serde_json::to_value(*message).unwrap_or_else(|_| json!({}))).into_response()
        }
        CompleteOutcome::Accepted(ack) => (StatusCode::ACCEPTED, Json(ack)).into_response(),
    }
}

async fn stream_handler(State(runtime): State<SharedRuntime>, body: String) -> Response {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(envelope) => return Json(*envelope).into_response(),
    };
    match runtime.stream().stream(value).await {
        Ok(rx) => {
            let stream = ReceiverStream::new(rx).map(|event| {
                let data = event.data().to_string();
                Ok::<_, Infallible>(SseEvent::default().event(event.event_type()).data(data))
            });
            Sse::new(stream).into_response()
        }
        Err(err) => Json(serde_json::to_value(*err).unwrap_or_else(|_| json!({}))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use patchbay_runtime::RuntimeOptions;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "gateway-test-token";

    fn test_runtime() -> (TempDir, SharedRuntime) {
        let dir = TempDir::new().unwrap();
        let mut env = HashMap::new();
        env.insert("REGISTRATION_TOKEN".to_string(), TOKEN.to_string());
        let runtime = Runtime::new(RuntimeOptions {
            library_root: Some(dir.path().join("library")),
            data_root: Some(dir.path().join("data")),
            env: Some(env),
            user_config_path: Some(std::path::PathBuf::from("/nonexistent/config.yaml")),
            registration_token: Some(TOKEN.to_string()),
        })
        .unwrap();
        (dir, runtime)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["service"], "patchbay-router");
    }

    #[tokio::test]
    async fn catalog_lists_builtin_capabilities() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/router/catalog")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert!(body["catalog"]["chat.general"].is_array());
    }

    #[tokio::test]
    async fn route_returns_protocol_messages() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(post_json(
                "/route",
                json!({
                    "protocol_version": "0.1",
                    "message_id": patchbay_core::new_uuid(),
                    "intent": "chat.general",
                    "payload": {"text": "hello"},
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["intent"], "chat.response");
        assert_eq!(body["payload"]["text"], "hello");
    }

    #[tokio::test]
    async fn malformed_route_bodies_get_error_envelopes() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(post_json("/route", json!({"intent": "chat.general"})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["intent"], "error");
        assert_eq!(body["payload"]["error"]["code"], "E_BAD_MESSAGE");
    }

    #[tokio::test]
    async fn register_and_heartbeat_lifecycle() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);

        let descriptor = json!({
            "node_id": "remote.worker",
            "node_version": "1.0.0",
            "endpoint_url": "http://worker:9000/handle",
            "supported_protocol_versions": ["0.1"],
            "capabilities": [{
                "name": "remote.echo",
                "description": "remote echo",
                "input_schema": {"type": "object"},
                "risk_class": "read",
                "required_extensions": [],
                "approval_required": false,
                "examples": ["echo"],
                "idempotency": "idempotent",
                "side_effect_scope": "none",
                "capability_version": "0.1.0",
            }],
            "priority": 100,
            "auth": {"registration_token": TOKEN},
        });

        let response = app
            .clone()
            .oneshot(post_json("/router/node/register", descriptor.clone()))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        let lease = body["lease_token"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                "/router/node/heartbeat",
                json!({"node_id": "remote.worker", "lease_token": lease}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/router/node/heartbeat",
                json!({"node_id": "remote.ghost", "lease_token": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Untrusted registrations are refused with the specific code.
        let mut untrusted = descriptor;
        untrusted["auth"] = json!({"registration_token": "wrong"});
        let response = app
            .oneshot(post_json("/router/node/register", untrusted))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], "E_NODE_UNTRUSTED");
    }

    #[tokio::test]
    async fn route_async_accepts_with_202() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime.clone());
        let message_id = patchbay_core::new_uuid();
        let response = app
            .clone()
            .oneshot(post_json(
                "/route_async",
                json!({
                    "protocol_version": "0.1",
                    "message_id": message_id,
                    "intent": "chat.general",
                    "payload": {"text": "hello"},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["status_url"], format!("/status/{message_id}"));

        // The status projection is immediately queryable.
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/status/{message_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn status_of_unknown_message_is_404() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/status/never-seen")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn intent_analyze_over_http() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(post_json(
                "/intent/analyze",
                json!({"message": "list folders"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["analysis"]["canonical_intent"], "folder.list");
    }

    #[tokio::test]
    async fn intent_route_reports_confirmation_gate() {
        let (_dir, runtime) = test_runtime();
        let app = build_router(runtime);
        let response = app
            .oneshot(post_json(
                "/intent/route",
                json!({"message": "write file notes.md with hello", "confirm": false}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["status"], "route_error");
        assert_eq!(
            body["route_response"]["payload"]["error"]["code"],
            "E_CONFIRMATION_REQUIRED"
        );
    }
}
