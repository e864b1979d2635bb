//! Memory filesystem node: reads and approval-gated writes confined to
//! the library root.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, json};

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_response,
};

use crate::{NodeContext, cap, object_schema, safe_path};

const MAX_SEARCH_MATCHES: usize = 50;

pub struct MemoryFsNode {
    ctx: NodeContext,
}

impl MemoryFsNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, String> {
        safe_path(&self.ctx.library_root, relative)
    }

    fn relative_display(&self, path: &std::path::Path) -> String {
        path.strip_prefix(&self.ctx.library_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn walk_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut pending = vec![self.ctx.library_root.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.is_file() {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
    }
}

#[async_trait]
impl CapabilityNode for MemoryFsNode {
    fn node_id(&self) -> &str {
        "node.memory.fs"
    }

    fn priority(&self) -> i64 {
        180
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![
            cap(
                "memory.read",
                "Read file content from library",
                object_schema(&["path"]),
                RiskClass::Read,
                &[],
                false,
                &["read finances/spec.md"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
            cap(
                "memory.list",
                "List files under library path",
                object_schema(&[]),
                RiskClass::Read,
                &[],
                false,
                &["list files"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
            cap(
                "memory.search",
                "Search text in library files",
                object_schema(&["query"]),
                RiskClass::Read,
                &[],
                false,
                &["search for milestone"],
                Idempotency::Idempotent,
                SideEffectScope::None,
            ),
            cap(
                "memory.write.propose",
                "Write content to file after approval",
                object_schema(&["path", "content"]),
                RiskClass::Mutate,
                &[],
                true,
                &["save spec.md"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
            cap(
                "memory.edit.propose",
                "Edit existing file after approval",
                object_schema(&["path"]),
                RiskClass::Mutate,
                &[],
                true,
                &["update plan.md"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
            cap(
                "memory.delete.propose",
                "Delete file after approval",
                object_schema(&["path"]),
                RiskClass::Destructive,
                &[],
                true,
                &["delete old draft"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
        ]
    }

    async fn handle(&self, message: Message) -> Message {
        let parent_id = message.message_id.clone();
        let intent = message.intent.as_str();

        match intent {
            "memory.list" => {
                let rel = message.payload_str("path").unwrap_or(".").to_string();
                let base = match self.resolve(&rel) {
                    Ok(base) => base,
                    Err(e) => return make_error(ErrorCode::BadMessage, &e, Some(&parent_id)),
                };
                if !base.is_dir() {
                    return make_error(
                        ErrorCode::NodeError,
                        &format!("Directory not found: {rel}"),
                        Some(&parent_id),
                    );
                }
                let mut entries: Vec<serde_json::Value> = Vec::new();
                let Ok(dir_entries) = std::fs::read_dir(&base) else {
                    return make_error(
                        ErrorCode::NodeError,
                        &format!("Directory not readable: {rel}"),
                        Some(&parent_id),
                    );
                };
                let mut children: Vec<PathBuf> = dir_entries.flatten().map(|e| e.path()).collect();
                children.sort();
                for child in children {
                    entries.push(json!({
                        "path": self.relative_display(&child),
                        "is_dir": child.is_dir(),
                    }));
                }
                let mut payload = Map::new();
                payload.insert("entries".to_string(), json!(entries));
                make_response("memory.listed", payload, Some(&parent_id))
            }

            "memory.read" => {
                let rel = message.payload_str("path").unwrap_or("").to_string();
                let target = match self.resolve(&rel) {
                    Ok(target) => target,
                    Err(e) => return make_error(ErrorCode::BadMessage, &e, Some(&parent_id)),
                };
                let Ok(content) = std::fs::read_to_string(&target) else {
                    return make_error(
                        ErrorCode::NodeError,
                        &format!("File not found: {rel}"),
                        Some(&parent_id),
                    );
                };
                let mut payload = Map::new();
                payload.insert("path".to_string(), json!(rel));
                payload.insert("content".to_string(), json!(content));
                make_response("memory.read.result", payload, Some(&parent_id))
            }

            "memory.search" => {
                let query = message.payload_str("query").unwrap_or("").trim().to_string();
                if query.is_empty() {
                    return make_error(ErrorCode::BadMessage, "query is required", Some(&parent_id));
                }
                let needle = query.to_lowercase();
                let mut matches: Vec<serde_json::Value> = Vec::new();
                'files: for file in self.walk_files() {
                    let Ok(content) = std::fs::read_to_string(&file) else {
                        continue;
                    };
                    for (index, line) in content.lines().enumerate() {
                        if line.to_lowercase().contains(&needle) {
                            matches.push(json!({
                                "path": self.relative_display(&file),
                                "line_number": index + 1,
                                "line": line.trim(),
                            }));
                            if matches.len() >= MAX_SEARCH_MATCHES {
                                break 'files;
                            }
                        }
                    }
                }
                let mut payload = Map::new();
                payload.insert("query".to_string(), json!(query));
                payload.insert("matches".to_string(), json!(matches));
                make_response("memory.search.result", payload, Some(&parent_id))
            }

            "memory.write.propose" | "memory.edit.propose" | "memory.delete.propose" => {
                if !message.confirmation_approved() {
                    return make_error(
                        ErrorCode::ConfirmationRequired,
                        "Approval required before applying changes.",
                        Some(&parent_id),
                    );
                }
                let rel = message.payload_str("path").unwrap_or("").to_string();
                let target = match self.resolve(&rel) {
                    Ok(target) => target,
                    Err(e) => return make_error(ErrorCode::BadMessage, &e, Some(&parent_id)),
                };

                match intent {
                    "memory.write.propose" => {
                        let Some(content) = message.payload_str("content") else {
                            return make_error(
                                ErrorCode::BadMessage,
                                "content is required",
                                Some(&parent_id),
                            );
                        };
                        if let Some(parent) = target.parent() {
                            if let Err(e) = std::fs::create_dir_all(parent) {
                                return make_error(
                                    ErrorCode::NodeError,
                                    &format!("Failed to create parent directory: {e}"),
                                    Some(&parent_id),
                                );
                            }
                        }
                        if let Err(e) = std::fs::write(&target, content) {
                            return make_error(
                                ErrorCode::NodeError,
                                &format!("Failed to write file: {e}"),
                                Some(&parent_id),
                            );
                        }
                        let mut payload = Map::new();
                        payload.insert("path".to_string(), json!(rel));
                        payload.insert("bytes_written".to_string(), json!(content.len()));
                        make_response("memory.write.applied", payload, Some(&parent_id))
                    }
                    "memory.edit.propose" => {
                        if !target.is_file() {
                            return make_error(
                                ErrorCode::NodeError,
                                &format!("File not found: {rel}"),
                                Some(&parent_id),
                            );
                        }
                        let Some(content) = message.payload_str("content") else {
                            return make_error(
                                ErrorCode::BadMessage,
                                "content is required",
                                Some(&parent_id),
                            );
                        };
                        if let Err(e) = std::fs::write(&target, content) {
                            return make_error(
                                ErrorCode::NodeError,
                                &format!("Failed to edit file: {e}"),
                                Some(&parent_id),
                            );
                        }
                        let mut payload = Map::new();
                        payload.insert("path".to_string(), json!(rel));
                        payload.insert("bytes_written".to_string(), json!(content.len()));
                        make_response("memory.edit.applied", payload, Some(&parent_id))
                    }
                    _ => {
                        if !target.is_file() {
                            return make_error(
                                ErrorCode::NodeError,
                                &format!("File not found: {rel}"),
                                Some(&parent_id),
                            );
                        }
                        if let Err(e) = std::fs::remove_file(&target) {
                            return make_error(
                                ErrorCode::NodeError,
                                &format!("Failed to delete file: {e}"),
                                Some(&parent_id),
                            );
                        }
                        let mut payload = Map::new();
                        payload.insert("path".to_string(), json!(rel));
                        payload.insert("deleted".to_string(), json!(true));
                        make_response("memory.delete.applied", payload, Some(&parent_id))
                    }
                }
            }

            _ => make_error(ErrorCode::NoRoute, "Unsupported intent", Some(&parent_id)),
        }
    }
}
