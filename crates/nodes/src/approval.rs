//! Approval gate: the proposal/resolve state machine guarding mutations.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_response, now_iso,
};

use crate::{NodeContext, cap, object_schema};

const STATE_NAME: &str = "approvals";

pub struct ApprovalGateNode {
    ctx: NodeContext,
    state: Mutex<Map<String, Value>>,
}

impl ApprovalGateNode {
    pub fn new(ctx: NodeContext) -> Self {
        let loaded = ctx.persistence.load_state(STATE_NAME, json!({"requests": {}}));
        let mut state = loaded.as_object().cloned().unwrap_or_default();
        if !state.get("requests").is_some_and(Value::is_object) {
            state.insert("requests".to_string(), json!({}));
        }
        Self {
            ctx,
            state: Mutex::new(state),
        }
    }

    fn save(&self, state: &Map<String, Value>) -> Result<(), String> {
        self.ctx
            .persistence
            .save_state(STATE_NAME, &Value::Object(state.clone()))
            .map_err(|e| e.to_string())
    }

    fn handle_request(&self, message: &Message) -> Message {
        let parent_id = message.message_id.as_str();
        let guarded = message
            .payload_str("intent_being_guarded")
            .unwrap_or("")
            .trim()
            .to_string();
        if guarded.is_empty() {
            return make_error(
                ErrorCode::BadMessage,
                "intent_being_guarded is required",
                Some(parent_id),
            );
        }
        let changes = message.payload.get("changes").and_then(Value::as_array);
        let Some(changes) = changes.filter(|c| !c.is_empty()) else {
            return make_error(
                ErrorCode::BadMessage,
                "changes must be non-empty list",
                Some(parent_id),
            );
        };

        let request_id = message
            .payload_str("request_id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("appr-{}", Uuid::new_v4()));

        let record = json!({
            "request_id": request_id,
            "intent_being_guarded": guarded,
            "changes": changes,
            "status": "pending",
            "requested_at": now_iso(),
            "resolved_at": Value::Null,
            "decision": Value::Null,
            "decision_note": "",
        });

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(requests) = state.get_mut("requests").and_then(Value::as_object_mut) {
            requests.insert(request_id.clone(), record.clone());
        }
        if let Err(e) = self.save(&state) {
            return make_error(ErrorCode::NodeError, &e, Some(parent_id));
        }
        drop(state);

        let payload = record.as_object().cloned().unwrap_or_default();
        make_response("approval.requested", payload, Some(parent_id))
    }

    fn handle_resolve(&self, message: &Message) -> Message {
        let parent_id = message.message_id.as_str();
        let request_id = message
            .payload_str("request_id")
            .unwrap_or("")
            .trim()
            .to_string();
        if request_id.is_empty() {
            return make_error(ErrorCode::BadMessage, "request_id is required", Some(parent_id));
        }
        let decision = message
            .payload_str("decision")
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if decision != "approved" && decision != "denied" {
            return make_error(
                ErrorCode::BadMessage,
                "decision must be approved|denied",
                Some(parent_id),
            );
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = state
            .get_mut("requests")
            .and_then(Value::as_object_mut)
            .and_then(|requests| requests.get_mut(&request_id))
            .and_then(Value::as_object_mut)
        else {
            return make_error(
                ErrorCode::NoRoute,
                &format!("approval request not found: {request_id}"),
                Some(parent_id),
            );
        };

        record.insert("status".to_string(), json!(decision));
        record.insert("decision".to_string(), json!(decision));
        record.insert("resolved_at".to_string(), json!(now_iso()));
        record.insert(
            "decision_note".to_string(),
            json!(message.payload_str("decision_note").unwrap_or("")),
        );
        record.insert(
            "decided_by".to_string(),
            json!(message.payload_str("decided_by").unwrap_or("owner")),
        );
        let mut payload = record.clone();

        if let Err(e) = self.save(&state) {
            return make_error(ErrorCode::NodeError, &e, Some(parent_id));
        }
        drop(state);

        payload.insert(
            "confirmation".to_string(),
            json!({
                "required": true,
                "status": decision,
                "request_id": request_id,
            }),
        );
        make_response("approval.resolved", payload, Some(parent_id))
    }
}

#[async_trait]
impl CapabilityNode for ApprovalGateNode {
    fn node_id(&self) -> &str {
        "node.approval.gate"
    }

    fn priority(&self) -> i64 {
        190
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![
            cap(
                "approval.request",
                "Create approval request for pending mutation",
                object_schema(&["intent_being_guarded", "changes"]),
                RiskClass::Read,
                &[],
                false,
                &["request approval for spec save"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
            cap(
                "approval.resolve",
                "Resolve approval request",
                object_schema(&["request_id", "decision"]),
                RiskClass::Read,
                &[],
                false,
                &["approve request appr-123"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
        ]
    }

    async fn handle(&self, message: Message) -> Message {
        match message.intent.as_str() {
            "approval.request" => self.handle_request(&message),
            "approval.resolve" => self.handle_resolve(&message),
            _ => make_error(ErrorCode::NoRoute, "Unsupported intent", Some(&message.message_id)),
        }
    }
}
