//! Target resolution: inline directives, node profiles, and generation
//! options.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use patchbay_core::Message;

static NODE_DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/node:(\S+)$").unwrap());
static MODEL_DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/model:(\S+)$").unwrap());

/// Inline `/node:` and `/model:` tokens extracted from the text.
#[derive(Debug, Clone, PartialEq)]
pub struct Directives {
    pub node: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
}

/// Pull directive tokens out of the text; everything else rejoins as the
/// prompt.
pub fn parse_directives(text: &str) -> Directives {
    let mut node = None;
    let mut model = None;
    let mut cleaned: Vec<&str> = Vec::new();

    for token in text.split_whitespace() {
        if let Some(captures) = NODE_DIRECTIVE_RE.captures(token) {
            node = Some(captures[1].to_string());
            continue;
        }
        if let Some(captures) = MODEL_DIRECTIVE_RE.captures(token) {
            model = Some(captures[1].to_string());
            continue;
        }
        cleaned.push(token);
    }

    Directives {
        node,
        model,
        prompt: cleaned.join(" ").trim().to_string(),
    }
}

/// A selectable assistant persona with its default model.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub key: &'static str,
    pub node_id: &'static str,
    pub default_model: &'static str,
    pub system_prompt: &'static str,
}

/// Built-in profiles; `general` is the fallback for unknown keys.
pub const NODE_PROFILES: &[NodeProfile] = &[
    NodeProfile {
        key: "general",
        node_id: "node.assistant.general",
        default_model: "ministral-3:8b",
        system_prompt: "You are the Patchbay general assistant node. Answer clearly, directly, \
                        and keep responses useful for engineering work.",
    },
    NodeProfile {
        key: "builder",
        node_id: "node.assistant.builder",
        default_model: "qwen3:8b",
        system_prompt: "You are the Patchbay builder node. Provide implementation-first \
                        guidance, concrete steps, and production-minded tradeoffs.",
    },
];

fn profile_for(key: &str) -> &'static NodeProfile {
    NODE_PROFILES
        .iter()
        .find(|profile| profile.key == key)
        .unwrap_or(&NODE_PROFILES[0])
}

/// The fully resolved invocation target.
#[derive(Debug, Clone)]
pub struct Target {
    pub node: String,
    pub node_id: String,
    pub model: String,
    pub prompt: String,
    pub system_prompt: String,
}

/// Resolve the target by layering: inline directives → `extensions.llm` →
/// profile defaults.
pub fn resolve_target(message: &Message) -> Target {
    let llm = message.llm_extension();
    let raw_text = message.payload_str("text").unwrap_or_default();
    let directives = parse_directives(raw_text);

    let node_key = directives
        .node
        .or_else(|| llm.get("node").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "general".to_string());
    let profile = profile_for(&node_key);

    let model = directives
        .model
        .or_else(|| llm.get("model").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| profile.default_model.to_string());

    let prompt = if directives.prompt.is_empty() {
        raw_text.trim().to_string()
    } else {
        directives.prompt
    };

    Target {
        node: profile.key.to_string(),
        node_id: profile.node_id.to_string(),
        model,
        prompt,
        system_prompt: profile.system_prompt.to_string(),
    }
}

/// Generation options applied to the provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

fn parse_stop_sequences(value: &Value) -> Vec<String> {
    let candidates: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };

    let mut out: Vec<String> = Vec::new();
    for raw in candidates {
        let token = raw.trim();
        if !token.is_empty() && !out.iter().any(|existing| existing == token) {
            out.push(token.to_string());
        }
    }
    out
}

/// Resolve `max_tokens` and `stop` from the message, falling back to the
/// configured defaults.
pub fn resolve_options(
    message: &Message,
    default_max_tokens: u32,
    default_stop: &[String],
) -> GenerationOptions {
    let llm: Map<String, Value> = message.llm_extension();

    let raw_max_tokens = llm
        .get("max_tokens")
        .or_else(|| llm.get("num_predict"))
        .or_else(|| message.payload.get("max_tokens"));
    let max_tokens = raw_max_tokens
        .and_then(Value::as_i64)
        .filter(|value| *value > 0)
        .map(|value| value as u32)
        .unwrap_or(default_max_tokens);

    let raw_stop = llm.get("stop").or_else(|| message.payload.get("stop"));
    let stop = match raw_stop {
        Some(value) => parse_stop_sequences(value),
        None => default_stop.to_vec(),
    };

    GenerationOptions { max_tokens, stop }
}
