//! General chat node: the default conversational surface.

use async_trait::async_trait;
use serde_json::{Value, json};

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_response,
};

use crate::{NodeContext, cap, object_schema};

pub struct ChatGeneralNode {
    ctx: NodeContext,
}

impl ChatGeneralNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    /// "what next" answers come from the active folder's plan when one
    /// exists.
    fn next_steps_response(&self, parent_id: &str) -> Option<Message> {
        let active_folder = self
            .ctx
            .workflow_state
            .read("active_folder", json!(""))
            .as_str()
            .unwrap_or("")
            .to_string();
        if active_folder.is_empty() {
            return None;
        }

        let plan_path = self.ctx.library_root.join(&active_folder).join("plan.md");
        let plan_text = std::fs::read_to_string(&plan_path).ok()?;
        let bullets: Vec<String> = plan_text
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("- "))
            .take(3)
            .map(str::to_string)
            .collect();
        let next_steps = if bullets.is_empty() {
            vec!["Review plan milestones and pick the top-priority task.".to_string()]
        } else {
            bullets
        };

        let mut payload = serde_json::Map::new();
        payload.insert("text".to_string(), json!("Next steps from your plan:"));
        payload.insert("next_steps".to_string(), json!(next_steps));
        payload.insert("source".to_string(), json!(format!("{active_folder}/plan.md")));
        Some(make_response("chat.response", payload, Some(parent_id)))
    }
}

#[async_trait]
impl CapabilityNode for ChatGeneralNode {
    fn node_id(&self) -> &str {
        "interface.cli"
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![
            cap(
                "chat.general",
                "General chat response",
                object_schema(&["text"]),
                RiskClass::Read,
                &[],
                false,
                &["chat about my goals"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
            cap(
                "runtime.cancel_generation",
                "Cancel active generation",
                object_schema(&[]),
                RiskClass::Read,
                &[],
                false,
                &["stop generating"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
            cap(
                "runtime.compact_context",
                "Compact current context when token budget is high",
                object_schema(&[]),
                RiskClass::Read,
                &[],
                false,
                &["compact context"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
        ]
    }

    async fn handle(&self, message: Message) -> Message {
        let parent_id = message.message_id.clone();
        match message.intent.as_str() {
            "runtime.cancel_generation" => {
                let mut payload = serde_json::Map::new();
                payload.insert("cancelled".to_string(), json!(true));
                make_response("runtime.cancelled", payload, Some(&parent_id))
            }
            "runtime.compact_context" => {
                let mut payload = serde_json::Map::new();
                payload.insert("compacted".to_string(), json!(true));
                payload.insert(
                    "notice".to_string(),
                    json!("Conversation context was compacted to preserve responsiveness."),
                );
                make_response("runtime.context_compacted", payload, Some(&parent_id))
            }
            "chat.general" => {
                let text = message.payload_str("text").unwrap_or_default().to_string();
                if text.to_lowercase().contains("what next") {
                    if let Some(response) = self.next_steps_response(&parent_id) {
                        return response;
                    }
                }
                let mut payload = serde_json::Map::new();
                payload.insert("text".to_string(), Value::String(text));
                payload.insert("note".to_string(), json!("Handled by interface.cli"));
                make_response("chat.response", payload, Some(&parent_id))
            }
            _ => make_error(ErrorCode::NoRoute, "Unsupported intent", Some(&parent_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, message};

    #[tokio::test]
    async fn echoes_chat_text() {
        let (_dir, ctx) = context();
        let node = ChatGeneralNode::new(ctx);
        let response = node.handle(message("chat.general", json!({"text": "hello"}))).await;
        assert_eq!(response.intent, "chat.response");
        assert_eq!(response.payload_str("text"), Some("hello"));
    }

    #[tokio::test]
    async fn what_next_reads_the_active_plan() {
        let (_dir, ctx) = context();
        let folder = ctx.library_root.join("finances");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("plan.md"), "# Plan\n- open an account\n- fund it\ntext\n- review\n- extra").unwrap();
        ctx.workflow_state
            .update(serde_json::Map::from_iter([(
                "active_folder".to_string(),
                json!("finances"),
            )]))
            .unwrap();

        let node = ChatGeneralNode::new(ctx);
        let response = node
            .handle(message("chat.general", json!({"text": "what next?"})))
            .await;
        assert_eq!(response.payload["next_steps"], json!(["- open an account", "- fund it", "- review"]));
        assert_eq!(response.payload["source"], "finances/plan.md");
    }

    #[tokio::test]
    async fn rejects_foreign_intents() {
        let (_dir, ctx) = context();
        let node = ChatGeneralNode::new(ctx);
        let response = node.handle(message("folder.list", json!({}))).await;
        assert_eq!(response.error_code(), Some("E_NO_ROUTE"));
    }
}
