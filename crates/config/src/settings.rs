//! Runtime settings resolved from the environment.

use std::collections::HashMap;
use std::path::PathBuf;

/// Knobs read once at startup. Unprefixed names are core contract;
/// provider-specific variables carry the `PATCHBAY_` prefix.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Shared secret nodes must present when registering.
    pub registration_token: String,

    pub heartbeat_ttl_sec: f64,
    pub node_timeout_sec: f64,
    pub model_timeout_sec: f64,

    pub library_root: PathBuf,
    pub data_root: PathBuf,
    pub user_config_path: Option<PathBuf>,

    // Async pipeline
    pub max_attempts: u32,
    pub retry_delay_sec: f64,

    // Stream front-end
    pub async_fallback_enabled: bool,
    pub async_fallback_min_chars: usize,
    pub async_fallback_route_url: Option<String>,
    pub async_fallback_status_base: Option<String>,
    /// Native Ollama API base for the streaming front-end (`/api/chat`).
    pub ollama_base_url: Option<String>,
    pub ollama_default_max_tokens: u32,
    pub ollama_default_stop: Vec<String>,
}

impl RuntimeSettings {
    /// Resolve settings from an environment snapshot.
    pub fn from_env(env: &HashMap<String, String>) -> Self {
        Self {
            registration_token: non_empty(env, "REGISTRATION_TOKEN")
                .unwrap_or_else(|| "patchbay-dev-token".to_string()),
            heartbeat_ttl_sec: parse_f64(env, "HEARTBEAT_TTL_SEC", 15.0),
            node_timeout_sec: parse_f64(env, "NODE_TIMEOUT_SEC", 3.0),
            model_timeout_sec: parse_f64(env, "MODEL_TIMEOUT_SEC", 30.0),
            library_root: non_empty(env, "LIBRARY_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("library")),
            data_root: non_empty(env, "DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            user_config_path: non_empty(env, "USER_CONFIG_PATH").map(PathBuf::from),
            max_attempts: parse_u32(env, "MAX_ATTEMPTS", 3).max(1),
            retry_delay_sec: parse_f64(env, "RETRY_DELAY_SEC", 1.0),
            async_fallback_enabled: parse_bool(env, "ASYNC_FALLBACK_ENABLED", true),
            async_fallback_min_chars: parse_u32(env, "ASYNC_FALLBACK_MIN_CHARS", 700) as usize,
            async_fallback_route_url: non_empty(env, "ASYNC_FALLBACK_ROUTE_URL"),
            async_fallback_status_base: non_empty(env, "ASYNC_FALLBACK_STATUS_BASE")
                .map(|s| s.trim_end_matches('/').to_string()),
            ollama_base_url: non_empty(env, "OLLAMA_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string()),
            ollama_default_max_tokens: parse_u32(env, "OLLAMA_DEFAULT_MAX_TOKENS", 512).max(1),
            ollama_default_stop: parse_csv(env, "OLLAMA_DEFAULT_STOP"),
        }
    }
}

fn non_empty(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_f64(env: &HashMap<String, String>, key: &str, default: f64) -> f64 {
    non_empty(env, key)
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| *v > 0.0)
        .unwrap_or(default)
}

fn parse_u32(env: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    non_empty(env, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(env: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match non_empty(env, key) {
        Some(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn parse_csv(env: &HashMap<String, String>, key: &str) -> Vec<String> {
    let Some(raw) = non_empty(env, key) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if !token.is_empty() && !out.iter().any(|existing| existing == token) {
            out.push(token.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn built_in_defaults() {
        let settings = RuntimeSettings::from_env(&HashMap::new());
        assert_eq!(settings.heartbeat_ttl_sec, 15.0);
        assert_eq!(settings.node_timeout_sec, 3.0);
        assert_eq!(settings.model_timeout_sec, 30.0);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.retry_delay_sec, 1.0);
        assert!(settings.async_fallback_enabled);
        assert_eq!(settings.async_fallback_min_chars, 700);
        assert_eq!(settings.ollama_default_max_tokens, 512);
        assert!(settings.ollama_default_stop.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = RuntimeSettings::from_env(&env(&[
            ("REGISTRATION_TOKEN", "prod-secret"),
            ("HEARTBEAT_TTL_SEC", "30"),
            ("MAX_ATTEMPTS", "5"),
            ("ASYNC_FALLBACK_ENABLED", "off"),
            ("OLLAMA_DEFAULT_STOP", "###, STOP ,###"),
        ]));
        assert_eq!(settings.registration_token, "prod-secret");
        assert_eq!(settings.heartbeat_ttl_sec, 30.0);
        assert_eq!(settings.max_attempts, 5);
        assert!(!settings.async_fallback_enabled);
        assert_eq!(settings.ollama_default_stop, vec!["###", "STOP"]);
    }

    #[test]
    fn malformed_numbers_fall_back() {
        let settings =
            RuntimeSettings::from_env(&env(&[("NODE_TIMEOUT_SEC", "soon"), ("MAX_ATTEMPTS", "")]));
        assert_eq!(settings.node_timeout_sec, 3.0);
        assert_eq!(settings.max_attempts, 3);
    }
}
