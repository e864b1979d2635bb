//! Audit log node: append security-relevant events to the durable audit
//! channel.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_response,
};

use crate::{NodeContext, cap, object_schema};

const AUDIT_CHANNEL: &str = "audit";

pub struct AuditLogNode {
    ctx: NodeContext,
}

impl AuditLogNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CapabilityNode for AuditLogNode {
    fn node_id(&self) -> &str {
        "node.audit.log"
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![cap(
            "audit.log.record",
            "Record an audit event",
            object_schema(&["event"]),
            RiskClass::Read,
            &[],
            false,
            &["record approval decision"],
            Idempotency::NonIdempotent,
            SideEffectScope::File,
        )]
    }

    async fn handle(&self, message: Message) -> Message {
        let parent_id = message.message_id.clone();
        if message.intent != "audit.log.record" {
            return make_error(ErrorCode::NoRoute, "Unsupported intent", Some(&parent_id));
        }

        let event = message.payload_str("event").unwrap_or("").trim().to_string();
        if event.is_empty() {
            return make_error(ErrorCode::BadMessage, "event is required", Some(&parent_id));
        }
        let details = message
            .payload
            .get("details")
            .cloned()
            .unwrap_or_else(|| json!({}));

        self.ctx.persistence.emit_event(
            AUDIT_CHANNEL,
            &event,
            json!({"details": details, "message_id": parent_id}),
        );

        let mut payload = Map::new();
        payload.insert("recorded".to_string(), Value::Bool(true));
        payload.insert("event".to_string(), json!(event));
        make_response("audit.logged", payload, Some(&parent_id))
    }
}
