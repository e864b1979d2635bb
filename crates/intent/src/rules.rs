//! The ordered keyword/pattern rule table.
//!
//! First match wins. Each rule sets the canonical intent, a base
//! confidence, extracted payload fields, and mutation flags; the analyzer
//! overlays registry metadata and applies the confidence gate afterwards.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::plan::IntentPlan;
use patchbay_core::RiskClass;

static TOPIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:for|about)\s+(.+)$").unwrap());
static FOLDER_TOPIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:create|new|start)\s+(?:a\s+)?folder(?:\s+(?:called|named|for|about))?\s+(.+)$")
        .unwrap()
});
static LIST_FOLDERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\blist(?:\s+\w+){0,3}\s+folders?\b").unwrap());
static SWITCH_FOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:switch(?:\s+folder)?\s+(?:to\s+)?)|(?:work\s+on\s+)|(?:go\s+to\s+folder\s+)")
        .unwrap()
});
static TRAILING_PUNCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.?!]+$").unwrap());

/// Infer a topic from trailing "for …" / "about …" phrasing, falling back
/// to the whole text.
pub fn infer_topic(text: &str) -> String {
    if let Some(captures) = TOPIC_RE.captures(text) {
        let topic = captures[1].trim();
        if !topic.is_empty() {
            return topic.to_string();
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Strip wrapping quotes and trailing punctuation from a user-supplied
/// label.
pub fn clean_label(text: &str) -> String {
    let mut value = text.trim().to_string();
    if value.len() >= 2 {
        let quoted = (value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\''));
        if quoted {
            value = value[1..value.len() - 1].trim().to_string();
        }
    }
    value = TRAILING_PUNCT_RE.replace(&value, "").trim().to_string();
    if value.is_empty() { "untitled".to_string() } else { value }
}

/// The folder topic of a "create folder …" request.
pub fn extract_folder_topic(text: &str) -> String {
    if let Some(captures) = FOLDER_TOPIC_RE.captures(text) {
        return clean_label(&captures[1]);
    }
    clean_label(&infer_topic(text))
}

fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn contains_any(lower: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| lower.contains(needle))
}

/// Classify cleaned text into a plan. `awaiting_answer` is the interview
/// context fallback, consulted only when no keyword rule matched. Returns
/// the plan plus whether `memory.list` needs the active folder resolved.
pub fn classify(cleaned: &str, awaiting_answer: bool) -> (IntentPlan, bool) {
    let lower = cleaned.to_lowercase();
    let mut plan = IntentPlan::fallback(cleaned);
    let mut wants_active_folder = false;

    if LIST_FOLDERS_RE.is_match(&lower) || lower == "folders" || lower == "list folder" {
        plan.set_rule("folder.list", 0.96, &["keyword_folder_list"], payload(&[]));
    } else if contains_any(&lower, &["create folder", "new folder", "start folder"]) {
        plan.set_rule(
            "folder.create",
            0.95,
            &["keyword_folder_create"],
            payload(&[("topic", json!(extract_folder_topic(cleaned)))]),
        );
        plan.risk_class = RiskClass::Mutate;
        plan.required_confirmation = true;
    } else if contains_any(&lower, &["switch folder", "work on", "go to folder"]) {
        let mut folder = infer_topic(cleaned);
        if let Some(found) = SWITCH_FOLDER_RE.find(&lower) {
            let candidate = cleaned[found.end()..].trim();
            if !candidate.is_empty() {
                folder = candidate.to_string();
            }
        }
        plan.set_rule(
            "folder.switch",
            0.91,
            &["keyword_folder_switch"],
            payload(&[("folder", json!(folder.replace(' ', "-").to_lowercase()))]),
        );
    } else if contains_any(&lower, &["start interview", "interview me"]) {
        plan.set_rule(
            "workflow.interview.start",
            0.92,
            &["keyword_interview_start"],
            payload(&[]),
        );
    } else if contains_any(&lower, &["continue interview", "my answer", "answer:"]) {
        let answer = match cleaned.split_once(':') {
            Some((_, rest)) => rest.trim().to_string(),
            None => cleaned.to_string(),
        };
        plan.set_rule(
            "workflow.interview.continue",
            0.85,
            &["keyword_interview_continue"],
            payload(&[("answer", json!(answer))]),
        );
    } else if contains_any(&lower, &["complete interview", "finish interview"]) {
        plan.set_rule(
            "workflow.interview.complete",
            0.9,
            &["keyword_interview_complete"],
            payload(&[]),
        );
    } else if contains_any(&lower, &["generate spec", "draft spec"]) {
        plan.set_rule("workflow.spec.generate", 0.9, &["keyword_spec_generate"], payload(&[]));
    } else if contains_any(&lower, &["save spec", "propose spec"]) {
        plan.set_rule(
            "workflow.spec.propose_save",
            0.9,
            &["keyword_spec_propose_save"],
            payload(&[]),
        );
        plan.risk_class = RiskClass::Mutate;
    } else if contains_any(&lower, &["generate plan", "draft plan"]) {
        plan.set_rule("workflow.plan.generate", 0.89, &["keyword_plan_generate"], payload(&[]));
    } else if contains_any(&lower, &["save plan", "propose plan"]) {
        plan.set_rule(
            "workflow.plan.propose_save",
            0.89,
            &["keyword_plan_propose_save"],
            payload(&[]),
        );
        plan.risk_class = RiskClass::Mutate;
    } else if contains_any(&lower, &["read file", "open file"]) {
        plan.set_rule(
            "memory.read",
            0.84,
            &["keyword_memory_read"],
            payload(&[("path", json!(infer_topic(cleaned)))]),
        );
    } else if lower.contains("list files") {
        plan.set_rule("memory.list", 0.9, &["keyword_memory_list"], payload(&[]));
        wants_active_folder = true;
    } else if contains_any(&lower, &["search files", "search notes"]) {
        plan.set_rule(
            "memory.search",
            0.9,
            &["keyword_memory_search"],
            payload(&[("query", json!(infer_topic(cleaned)))]),
        );
    } else if contains_any(&lower, &["write file", "save file"]) {
        plan.set_rule(
            "memory.write.propose",
            0.88,
            &["keyword_memory_write"],
            payload(&[("path", json!("notes.md")), ("content", json!(cleaned))]),
        );
        plan.risk_class = RiskClass::Mutate;
        plan.required_confirmation = true;
    } else if contains_any(&lower, &["edit file", "update file"]) {
        plan.set_rule(
            "memory.edit.propose",
            0.83,
            &["keyword_memory_edit"],
            payload(&[("path", json!("notes.md")), ("content", json!(cleaned))]),
        );
        plan.risk_class = RiskClass::Mutate;
        plan.required_confirmation = true;
    } else if contains_any(&lower, &["delete file", "remove file"]) {
        plan.set_rule(
            "memory.delete.propose",
            0.86,
            &["keyword_memory_delete"],
            payload(&[("path", json!("notes.md"))]),
        );
        plan.risk_class = RiskClass::Destructive;
        plan.required_confirmation = true;
    } else if contains_any(&lower, &["list models", "model catalog"]) {
        plan.set_rule("model.catalog.list", 0.93, &["keyword_model_catalog"], payload(&[]));
    } else if contains_any(&lower, &["ask model", "complete with model"]) {
        let prompt = match cleaned.split_once("model") {
            Some((_, rest)) => rest.trim().to_string(),
            None => cleaned.to_string(),
        };
        let prompt = if prompt.is_empty() { cleaned.to_string() } else { prompt };
        plan.set_rule(
            "model.chat.complete",
            0.85,
            &["keyword_model_complete"],
            payload(&[("prompt", json!(prompt))]),
        );
    } else if contains_any(&lower, &["stream model", "stream response"]) {
        plan.set_rule(
            "model.chat.stream",
            0.85,
            &["keyword_model_stream"],
            payload(&[("prompt", json!(cleaned))]),
        );
    } else if awaiting_answer {
        plan.set_rule(
            "workflow.interview.continue",
            0.89,
            &["context_interview_awaiting_answer"],
            payload(&[("answer", json!(cleaned))]),
        );
    }

    (plan, wants_active_folder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_extraction() {
        assert_eq!(infer_topic("create a folder for home finances"), "home finances");
        assert_eq!(infer_topic("tell me about rust"), "rust");
        assert_eq!(infer_topic("no marker here"), "no marker here");
        assert_eq!(infer_topic("  "), "untitled");
    }

    #[test]
    fn labels_are_cleaned() {
        assert_eq!(clean_label("\"quoted topic\""), "quoted topic");
        assert_eq!(clean_label("'single'."), "single");
        assert_eq!(clean_label("plain!?"), "plain");
        assert_eq!(clean_label("''"), "untitled");
    }

    #[test]
    fn folder_topic_from_create_phrase() {
        assert_eq!(extract_folder_topic("create a folder called Taxes 2026."), "Taxes 2026");
        assert_eq!(extract_folder_topic("new folder for my novel"), "my novel");
    }

    #[test]
    fn list_folders_matches_variants() {
        for text in ["list folders", "list my project folders", "folders", "list folder"] {
            let (plan, _) = classify(text, false);
            assert_eq!(plan.canonical_intent, "folder.list", "text: {text}");
            assert!(plan.confidence >= 0.9);
        }
    }

    #[test]
    fn create_folder_is_a_guarded_mutation() {
        let (plan, _) = classify("create folder for finances", false);
        assert_eq!(plan.canonical_intent, "folder.create");
        assert_eq!(plan.risk_class, RiskClass::Mutate);
        assert!(plan.required_confirmation);
        assert_eq!(plan.payload["topic"], "finances");
    }

    #[test]
    fn switch_folder_slugs_the_name() {
        let (plan, _) = classify("switch folder to Home Finances", false);
        assert_eq!(plan.canonical_intent, "folder.switch");
        assert_eq!(plan.payload["folder"], "home-finances");
    }

    #[test]
    fn write_file_requires_confirmation() {
        let (plan, _) = classify("write file notes.md with hello", false);
        assert_eq!(plan.canonical_intent, "memory.write.propose");
        assert!(plan.required_confirmation);
        assert_eq!(plan.risk_class, RiskClass::Mutate);
    }

    #[test]
    fn delete_file_is_destructive() {
        let (plan, _) = classify("delete file old-draft.md", false);
        assert_eq!(plan.canonical_intent, "memory.delete.propose");
        assert_eq!(plan.risk_class, RiskClass::Destructive);
    }

    #[test]
    fn list_files_wants_active_folder() {
        let (plan, wants_active_folder) = classify("list files", false);
        assert_eq!(plan.canonical_intent, "memory.list");
        assert!(wants_active_folder);
    }

    #[test]
    fn interview_answer_splits_on_colon() {
        let (plan, _) = classify("answer: I want a budget tracker", false);
        assert_eq!(plan.canonical_intent, "workflow.interview.continue");
        assert_eq!(plan.payload["answer"], "I want a budget tracker");
    }

    #[test]
    fn context_fallback_to_interview_continue() {
        let (plan, _) = classify("something totally freeform", true);
        assert_eq!(plan.canonical_intent, "workflow.interview.continue");
        assert_eq!(plan.payload["answer"], "something totally freeform");
        assert_eq!(plan.reason_codes, vec!["context_interview_awaiting_answer"]);
    }

    #[test]
    fn unmatched_text_falls_back_to_model_chat() {
        let (plan, _) = classify("what is the meaning of life", false);
        assert_eq!(plan.canonical_intent, "model.chat.complete");
        assert_eq!(plan.reason_codes, vec!["fallback_model_chat"]);
        assert_eq!(plan.payload["prompt"], "what is the meaning of life");
    }
}
