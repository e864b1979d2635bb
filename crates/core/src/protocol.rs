//! Wire message shape, validation, error envelopes, and trace annotation.
//!
//! Every request and response at any boundary is a `Message`. Inbound JSON
//! is checked with [`validate_core`] before it is allowed to become one;
//! non-conforming payloads receive an `E_BAD_MESSAGE` envelope with a fresh
//! `message_id`. Every outgoing message from any component passes through
//! [`ensure_trace`].

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::ErrorCode;

/// The protocol version this build speaks. Exact-match enforced by the
/// router.
pub const PROTOCOL_VERSION: &str = "0.1";

/// A protocol message: the unit of exchange between clients, the router,
/// and capability nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub protocol_version: String,

    /// Globally unique per request; never reused.
    pub message_id: String,

    /// Canonical capability name, or the literal `"error"`.
    pub intent: String,

    /// Capability-specific body. Always a JSON object.
    pub payload: Map<String, Value>,

    /// Well-known sub-objects: identity, confirmation, llm, trace,
    /// confidence.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl Message {
    /// True when this is an error envelope.
    pub fn is_error(&self) -> bool {
        self.intent == "error"
    }

    /// The `payload.error.code` of an error envelope, if present.
    pub fn error_code(&self) -> Option<&str> {
        self.payload.get("error")?.get("code")?.as_str()
    }

    /// The `payload.error.retryable` flag of an error envelope.
    pub fn error_retryable(&self) -> bool {
        self.payload
            .get("error")
            .and_then(|e| e.get("retryable"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A string field of the payload, trimmed accessors left to callers.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// A named extension block, when it is an object.
    pub fn extension(&self, key: &str) -> Option<&Map<String, Value>> {
        self.extensions.get(key).and_then(Value::as_object)
    }

    /// Whether `extensions.confirmation.status` is `"approved"`
    /// (case-insensitive, matching the gate in the router).
    pub fn confirmation_approved(&self) -> bool {
        self.extension("confirmation")
            .and_then(|c| c.get("status"))
            .and_then(Value::as_str)
            .is_some_and(|s| s.eq_ignore_ascii_case("approved"))
    }

    /// The `extensions.llm` block, or an empty map.
    pub fn llm_extension(&self) -> Map<String, Value> {
        self.extension("llm").cloned().unwrap_or_default()
    }

    /// Current trace depth, 0 when no trace block exists.
    pub fn trace_depth(&self) -> i64 {
        self.extension("trace")
            .and_then(|t| t.get("depth"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// The trace path hops accumulated so far.
    pub fn trace_path(&self) -> Vec<String> {
        self.extension("trace")
            .and_then(|t| t.get("path"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Mint a fresh message id.
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC time in RFC 3339, the timestamp format of all logs and
/// snapshots.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Create-or-increment the trace block and append `hop` to `path` when
/// provided. Depth grows by exactly one per call.
pub fn ensure_trace(message: &mut Message, parent_message_id: Option<&str>, hop: Option<&str>) {
    let fallback_parent = parent_message_id
        .map(str::to_string)
        .unwrap_or_else(|| message.message_id.clone());

    let trace = message
        .extensions
        .entry("trace".to_string())
        .or_insert_with(|| {
            json!({
                "parent_message_id": fallback_parent.clone(),
                "depth": 0,
                "path": [],
            })
        });

    if let Some(trace) = trace.as_object_mut() {
        trace
            .entry("parent_message_id".to_string())
            .or_insert_with(|| Value::String(fallback_parent.clone()));
        let depth = trace.get("depth").and_then(Value::as_i64).unwrap_or(0);
        trace.insert("depth".to_string(), Value::from(depth + 1));
        let path = trace
            .entry("path".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let (Some(items), Some(hop)) = (path.as_array_mut(), hop) {
            items.push(Value::String(hop.to_string()));
        }
    }
}

/// Build a response message, tracing it back to its parent.
pub fn make_response(
    intent: &str,
    payload: Map<String, Value>,
    parent_message_id: Option<&str>,
) -> Message {
    let mut response = Message {
        protocol_version: PROTOCOL_VERSION.to_string(),
        message_id: new_uuid(),
        intent: intent.to_string(),
        payload,
        extensions: Map::new(),
    };
    if parent_message_id.is_some() {
        ensure_trace(&mut response, parent_message_id, None);
    }
    response
}

/// Build a non-retryable error envelope with empty details.
pub fn make_error(code: ErrorCode, message: &str, parent_message_id: Option<&str>) -> Message {
    make_error_with(code, message, parent_message_id, false, json!({}))
}

/// Build an error envelope with explicit retryability and details.
pub fn make_error_with(
    code: ErrorCode,
    message: &str,
    parent_message_id: Option<&str>,
    retryable: bool,
    details: Value,
) -> Message {
    let mut payload = Map::new();
    payload.insert(
        "error".to_string(),
        json!({
            "code": code.as_str(),
            "message": message,
            "retryable": retryable,
            "details": details,
        }),
    );

    let mut err = Message {
        protocol_version: PROTOCOL_VERSION.to_string(),
        message_id: new_uuid(),
        intent: "error".to_string(),
        payload,
        extensions: Map::new(),
    };
    if parent_message_id.is_some() {
        ensure_trace(&mut err, parent_message_id, None);
    }
    err
}

/// Validate the core message shape. Returns the typed message, or a ready
/// `E_BAD_MESSAGE` envelope describing the first violation.
pub fn validate_core(value: &Value) -> Result<Message, Box<Message>> {
    let Some(object) = value.as_object() else {
        return Err(Box::new(make_error(
            ErrorCode::BadMessage,
            "Message must be an object",
            None,
        )));
    };

    let msg_id = object.get("message_id").and_then(Value::as_str);

    for field in ["protocol_version", "message_id", "intent", "payload"] {
        if !object.contains_key(field) {
            return Err(Box::new(make_error(
                ErrorCode::BadMessage,
                &format!("Missing required field: {field}"),
                msg_id,
            )));
        }
    }

    let Some(protocol_version) = object.get("protocol_version").and_then(Value::as_str) else {
        return Err(Box::new(make_error(
            ErrorCode::BadMessage,
            "protocol_version must be string",
            msg_id,
        )));
    };
    let Some(message_id) = object.get("message_id").and_then(Value::as_str) else {
        return Err(Box::new(make_error(
            ErrorCode::BadMessage,
            "message_id must be string",
            msg_id,
        )));
    };
    let Some(intent) = object.get("intent").and_then(Value::as_str) else {
        return Err(Box::new(make_error(
            ErrorCode::BadMessage,
            "intent must be string",
            msg_id,
        )));
    };
    let Some(payload) = object.get("payload").and_then(Value::as_object) else {
        return Err(Box::new(make_error(
            ErrorCode::BadMessage,
            "payload must be object",
            msg_id,
        )));
    };

    let extensions = match object.get("extensions") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(Box::new(make_error(
                ErrorCode::BadMessage,
                "extensions must be object if present",
                msg_id,
            )));
        }
    };

    Ok(Message {
        protocol_version: protocol_version.to_string(),
        message_id: message_id.to_string(),
        intent: intent.to_string(),
        payload: payload.clone(),
        extensions,
    })
}

/// True when the value passes core validation.
pub fn looks_like_protocol(value: &Value) -> bool {
    validate_core(value).is_ok()
}
