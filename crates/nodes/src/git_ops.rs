//! Git operations node: version control for approved library changes.

use std::process::Output;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::process::Command;

use patchbay_core::{
    CapabilityMetadata, CapabilityNode, ErrorCode, Idempotency, Message, RiskClass,
    SideEffectScope, make_error, make_error_with, make_response,
};

use crate::{NodeContext, cap, object_schema, safe_path};

pub struct GitOpsNode {
    ctx: NodeContext,
}

impl GitOpsNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    async fn git(&self, args: &[&str]) -> std::io::Result<Output> {
        let safe_dir = self.ctx.library_root.display().to_string();
        Command::new("git")
            .arg("-c")
            .arg(format!("safe.directory={safe_dir}"))
            .arg("-c")
            .arg("user.email=router@patchbay.local")
            .arg("-c")
            .arg("user.name=Patchbay Router")
            .arg("-C")
            .arg(&self.ctx.library_root)
            .args(args)
            .output()
            .await
    }

    fn is_repo(&self) -> bool {
        self.ctx.library_root.join(".git").exists()
    }

    fn stderr_of(output: &Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }
}

#[async_trait]
impl CapabilityNode for GitOpsNode {
    fn node_id(&self) -> &str {
        "node.git.ops"
    }

    fn priority(&self) -> i64 {
        120
    }

    fn capabilities(&self) -> Vec<CapabilityMetadata> {
        vec![
            cap(
                "git.init_if_needed",
                "Initialize git repository when missing",
                object_schema(&[]),
                RiskClass::Mutate,
                &[],
                false,
                &["initialize git"],
                Idempotency::Idempotent,
                SideEffectScope::File,
            ),
            cap(
                "git.commit.approved_change",
                "Commit approved file changes",
                object_schema(&["paths", "commit_message"]),
                RiskClass::Mutate,
                &[],
                false,
                &["commit approved spec update"],
                Idempotency::NonIdempotent,
                SideEffectScope::File,
            ),
        ]
    }

    async fn handle(&self, message: Message) -> Message {
        let parent_id = message.message_id.clone();
        match message.intent.as_str() {
            "git.init_if_needed" => {
                if self.is_repo() {
                    let mut payload = Map::new();
                    payload.insert("initialized".to_string(), json!(false));
                    return make_response("git.ready", payload, Some(&parent_id));
                }
                match self.git(&["init"]).await {
                    Ok(output) if output.status.success() => {
                        let mut payload = Map::new();
                        payload.insert("initialized".to_string(), json!(true));
                        make_response("git.ready", payload, Some(&parent_id))
                    }
                    Ok(output) => make_error_with(
                        ErrorCode::NodeError,
                        "git init failed",
                        Some(&parent_id),
                        false,
                        json!({"stderr": Self::stderr_of(&output)}),
                    ),
                    Err(e) => make_error(
                        ErrorCode::NodeError,
                        &format!("git is unavailable: {e}"),
                        Some(&parent_id),
                    ),
                }
            }

            "git.commit.approved_change" => {
                if !self.is_repo() {
                    match self.git(&["init"]).await {
                        Ok(output) if output.status.success() => {}
                        _ => {
                            return make_error(ErrorCode::NodeError, "git init failed", Some(&parent_id));
                        }
                    }
                }

                let paths = message.payload.get("paths").and_then(Value::as_array);
                let Some(paths) = paths.filter(|p| !p.is_empty()) else {
                    return make_error(
                        ErrorCode::BadMessage,
                        "paths must be non-empty list",
                        Some(&parent_id),
                    );
                };
                let mut safe_paths: Vec<String> = Vec::with_capacity(paths.len());
                for item in paths {
                    let raw = item.as_str().unwrap_or_default();
                    match safe_path(&self.ctx.library_root, raw) {
                        Ok(_) => safe_paths.push(raw.trim().replace('\\', "/")),
                        Err(e) => return make_error(ErrorCode::BadMessage, &e, Some(&parent_id)),
                    }
                }

                let add_args: Vec<&str> = std::iter::once("add")
                    .chain(safe_paths.iter().map(String::as_str))
                    .collect();
                match self.git(&add_args).await {
                    Ok(output) if output.status.success() => {}
                    Ok(output) => {
                        return make_error_with(
                            ErrorCode::NodeError,
                            "git add failed",
                            Some(&parent_id),
                            false,
                            json!({"stderr": Self::stderr_of(&output)}),
                        );
                    }
                    Err(e) => {
                        return make_error(
                            ErrorCode::NodeError,
                            &format!("git is unavailable: {e}"),
                            Some(&parent_id),
                        );
                    }
                }

                let status = match self.git(&["status", "--porcelain"]).await {
                    Ok(output) if output.status.success() => output,
                    _ => return make_error(ErrorCode::NodeError, "git status failed", Some(&parent_id)),
                };
                if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
                    let mut payload = Map::new();
                    payload.insert("reason".to_string(), json!("no_changes"));
                    return make_response("git.commit.skipped", payload, Some(&parent_id));
                }

                let commit_message = message
                    .payload_str("commit_message")
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if commit_message.is_empty() {
                    return make_error(
                        ErrorCode::BadMessage,
                        "commit_message is required",
                        Some(&parent_id),
                    );
                }

                match self.git(&["commit", "-m", &commit_message]).await {
                    Ok(output) if output.status.success() => {
                        let mut payload = Map::new();
                        payload.insert("committed".to_string(), json!(true));
                        payload.insert("paths".to_string(), json!(safe_paths));
                        payload.insert("commit_message".to_string(), json!(commit_message));
                        make_response("git.committed", payload, Some(&parent_id))
                    }
                    Ok(output) => make_error_with(
                        ErrorCode::NodeError,
                        "git commit failed",
                        Some(&parent_id),
                        false,
                        json!({"stderr": Self::stderr_of(&output)}),
                    ),
                    Err(e) => make_error(
                        ErrorCode::NodeError,
                        &format!("git is unavailable: {e}"),
                        Some(&parent_id),
                    ),
                }
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
    async fn init_is_idempotent() {
        let (_dir, ctx) = context();
        let node = GitOpsNode::new(ctx);

        let response = node.handle(message("git.init_if_needed", json!({}))).await;
        assert_eq!(response.intent, "git.ready");
        assert_eq!(response.payload["initialized"], true);

        let response = node.handle(message("git.init_if_needed", json!({}))).await;
        assert_eq!(response.payload["initialized"], false);
    }

    #[tokio::test]
    async fn commit_applies_then_skips_when_clean() {
        let (_dir, ctx) = context();
        std::fs::write(ctx.library_root.join("notes.md"), "hello").unwrap();
        let node = GitOpsNode::new(ctx);

        let response = node
            .handle(message(
                "git.commit.approved_change",
                json!({"paths": ["notes.md"], "commit_message": "feat: add notes"}),
            ))
            .await;
        assert_eq!(response.intent, "git.committed");
        assert_eq!(response.payload["committed"], true);

        let response = node
            .handle(message(
                "git.commit.approved_change",
                json!({"paths": ["notes.md"], "commit_message": "feat: add notes"}),
            ))
            .await;
        assert_eq!(response.intent, "git.commit.skipped");
        assert_eq!(response.payload["reason"], "no_changes");
    }

    #[tokio::test]
    async fn commit_rejects_traversal_paths() {
        let (_dir, ctx) = context();
        let node = GitOpsNode::new(ctx);
        let response = node
            .handle(message(
                "git.commit.approved_change",
                json!({"paths": ["../escape.md"], "commit_message": "nope"}),
            ))
            .await;
        assert_eq!(response.error_code(), Some("E_BAD_MESSAGE"));
    }
}
