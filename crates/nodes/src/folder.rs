//! Folder workflow node: topic folders under the library root plus the
//! active-folder pointer in workflow state.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, json};

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_response,
};

use crate::{NodeContext, cap, object_schema};

static SLUG_STRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\-_\s]").unwrap());
static SLUG_JOIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_]+").unwrap());

/// Normalize a topic into a folder slug.
pub fn slugify(text: &str) -> String {
    let stripped = SLUG_STRIP_RE.replace_all(text.trim(), "").to_lowercase();
    let joined = SLUG_JOIN_RE.replace_all(&stripped, "-");
    let slug = joined.trim_matches('-').to_string();
    if slug.is_empty() { "untitled-topic".to_string() } else { slug }
}

pub struct FolderWorkflowNode {
    ctx: NodeContext,
}

impl FolderWorkflowNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    fn folders(&self) -> std::io::Result<Vec<String>> {
        let mut folders: Vec<String> = std::fs::read_dir(&self.ctx.library_root)?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        folders.sort();
        Ok(folders)
    }

    fn active_folder(&self) -> String {
        self.ctx
            .workflow_state
            .read("active_folder", json!(""))
            .as_str()
            .unwrap_or("")
            .to_string()
    }

    fn set_active_folder(&self, folder: &str) -> Result<(), String> {
        let mut patch = Map::new();
        patch.insert("active_folder".to_string(), json!(folder));
        self.ctx
            .workflow_state
            .update(patch)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl CapabilityNode for FolderWorkflowNode {
    fn node_id(&self) -> &str {
        "node.workflow.folder"
    }

    fn priority(&self) -> i64 {
        140
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![
            cap(
                "folder.create",
                "Create topic folder with AGENT.md",
                object_schema(&["topic"]),
                RiskClass::Mutate,
                &[],
                true,
                &["create folder for finances"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
            cap(
                "folder.switch",
                "Switch active folder context",
                object_schema(&["folder"]),
                RiskClass::Read,
                &[],
                false,
                &["switch to finances"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
            cap(
                "folder.list",
                "List available folders",
                object_schema(&[]),
                RiskClass::Read,
                &[],
                false,
                &["list folders"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
        ]
    }

    async fn handle(&self, message: Message) -> Message {
        let parent_id = message.message_id.clone();
        match message.intent.as_str() {
            "folder.list" => {
                let folders = match self.folders() {
                    Ok(folders) => folders,
                    Err(e) => {
                        return make_error(
                            ErrorCode::NodeError,
                            &format!("Failed to list library folders: {e}"),
                            Some(&parent_id),
                        );
                    }
                };
                let mut payload = Map::new();
                payload.insert("folders".to_string(), json!(folders));
                payload.insert("active_folder".to_string(), json!(self.active_folder()));
                make_response("folder.listed", payload, Some(&parent_id))
            }

            "folder.create" => {
                let topic = message.payload_str("topic").unwrap_or("").trim().to_string();
                if topic.is_empty() {
                    return make_error(ErrorCode::BadMessage, "topic is required", Some(&parent_id));
                }
                if !message.confirmation_approved() {
                    return make_error(
                        ErrorCode::ConfirmationRequired,
                        "Approval required before applying changes.",
                        Some(&parent_id),
                    );
                }

                let slug = slugify(&topic);
                let folder_dir = self.ctx.library_root.join(&slug);
                let created = !folder_dir.exists();
                if created {
                    if let Err(e) = std::fs::create_dir_all(&folder_dir) {
                        return make_error(
                            ErrorCode::NodeError,
                            &format!("Failed to create folder: {e}"),
                            Some(&parent_id),
                        );
                    }
                }
                let agent_md = folder_dir.join("AGENT.md");
                if !agent_md.exists() {
                    let body = format!(
                        "# {topic}\n\nThis folder holds working artifacts for \"{topic}\".\n\n\
                         - spec.md — what to build\n- plan.md — how to build it\n- interview.md — discovery notes\n"
                    );
                    if let Err(e) = std::fs::write(&agent_md, body) {
                        return make_error(
                            ErrorCode::NodeError,
                            &format!("Failed to write AGENT.md: {e}"),
                            Some(&parent_id),
                        );
                    }
                }
                if let Err(e) = self.set_active_folder(&slug) {
                    return make_error(ErrorCode::NodeError, &e, Some(&parent_id));
                }

                let mut payload = Map::new();
                payload.insert("folder".to_string(), json!(slug));
                payload.insert("created".to_string(), json!(created));
                payload.insert("active_folder".to_string(), json!(slug));
                make_response("folder.created", payload, Some(&parent_id))
            }

            "folder.switch" => {
                let folder = message.payload_str("folder").unwrap_or("").trim().to_string();
                if folder.is_empty() {
                    return make_error(ErrorCode::BadMessage, "folder is required", Some(&parent_id));
                }
                let slug = slugify(&folder);
                if !self.ctx.library_root.join(&slug).is_dir() {
                    return make_error(
                        ErrorCode::NodeError,
                        &format!("Folder not found: {slug}"),
                        Some(&parent_id),
                    );
                }
                if let Err(e) = self.set_active_folder(&slug) {
                    return make_error(ErrorCode::NodeError, &e, Some(&parent_id));
                }
                let mut payload = Map::new();
                payload.insert("active_folder".to_string(), json!(slug));
                make_response("folder.switched", payload, Some(&parent_id))
            }

            _ => make_error(ErrorCode::NoRoute, "Unsupported intent", Some(&parent_id)),
        }
    }
}
