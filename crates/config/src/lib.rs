//! Layered provider/model selection for model intents.
//!
//! Sources, highest priority first: `extensions.llm` override in the
//! request → user config file → environment → built-in fallback. Every
//! resolved field carries a provenance tag so responses can disclose where
//! the selection came from. The resolver also answers "are the
//! prerequisites for this provider satisfied?" and produces a startup
//! notice that never contains secret values.

mod settings;
mod yaml;

pub use settings::RuntimeSettings;
pub use yaml::parse_simple_yaml;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

pub const PROVIDER_OPENROUTER: &str = "openrouter";
pub const PROVIDER_OLLAMA: &str = "ollama";

const OPENROUTER_DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Where a resolved field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionSource {
    #[serde(rename = "request override")]
    RequestOverride,
    #[serde(rename = "user config")]
    UserConfig,
    #[serde(rename = ".env")]
    Env,
    #[serde(rename = "fallback")]
    Fallback,
}

impl SelectionSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestOverride => "request override",
            Self::UserConfig => "user config",
            Self::Env => ".env",
            Self::Fallback => "fallback",
        }
    }
}

/// A concrete `{provider, model}` choice with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct LlmSelection {
    pub provider: String,
    pub model: String,
    pub provider_source: SelectionSource,
    pub model_source: SelectionSource,
}

/// Static defaults for one provider.
#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub base_url: String,
    pub default_model: String,
}

/// The layered resolver. Holds an environment snapshot and the parsed user
/// config; both are read-only after construction.
pub struct ConfigResolver {
    env: HashMap<String, String>,
    user_config: Map<String, Value>,
}

impl ConfigResolver {
    /// Build a resolver from an environment snapshot, loading the user
    /// config from `user_config_path` (default `~/.patchbay/config.yaml`).
    pub fn new(env: HashMap<String, String>, user_config_path: Option<PathBuf>) -> Self {
        let path = user_config_path.unwrap_or_else(|| {
            let home = env
                .get("HOME")
                .cloned()
                .or_else(|| std::env::var("HOME").ok())
                .unwrap_or_else(|| ".".to_string());
            PathBuf::from(home).join(".patchbay").join("config.yaml")
        });

        let user_config = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                debug!(path = %path.display(), "User config loaded");
                parse_simple_yaml(&raw)
            }
            Err(_) => Map::new(),
        };

        Self { env, user_config }
    }

    fn env_value(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn llm_config(&self) -> Option<&Map<String, Value>> {
        self.user_config.get("llm").and_then(Value::as_object)
    }

    fn provider_config(&self, provider: &str) -> Option<&Map<String, Value>> {
        self.llm_config()?.get(provider).and_then(Value::as_object)
    }

    fn provider_config_str(&self, provider: &str, key: &str) -> Option<String> {
        self.provider_config(provider)?
            .get(key)
            .and_then(Value::as_str)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// The configured default provider with its provenance.
    pub fn default_provider(&self) -> (String, SelectionSource) {
        if let Some(provider) = self
            .llm_config()
            .and_then(|cfg| cfg.get("default_provider"))
            .and_then(Value::as_str)
        {
            if crate::is_known_provider(provider) {
                return (provider.to_string(), SelectionSource::UserConfig);
            }
        }

        if let Some(provider) = self.env_value("PATCHBAY_DEFAULT_PROVIDER") {
            let lowered = provider.to_lowercase();
            if crate::is_known_provider(&lowered) {
                return (lowered, SelectionSource::Env);
            }
        }

        (PROVIDER_OPENROUTER.to_string(), SelectionSource::Fallback)
    }

    /// Base URL + default model for a provider, user config over env.
    pub fn provider_defaults(&self, provider: &str) -> ProviderDefaults {
        if provider == PROVIDER_OPENROUTER {
            return ProviderDefaults {
                base_url: self
                    .provider_config_str(provider, "base_url")
                    .or_else(|| self.env_value("PATCHBAY_OPENROUTER_BASE_URL"))
                    .unwrap_or_else(|| OPENROUTER_DEFAULT_BASE_URL.to_string()),
                default_model: self
                    .provider_config_str(provider, "default_model")
                    .or_else(|| self.env_value("PATCHBAY_OPENROUTER_DEFAULT_MODEL"))
                    .unwrap_or_default(),
            };
        }

        ProviderDefaults {
            base_url: self
                .provider_config_str(provider, "base_url")
                .or_else(|| self.env_value("PATCHBAY_OLLAMA_BASE_URL"))
                .unwrap_or_default(),
            default_model: self
                .provider_config_str(provider, "default_model")
                .or_else(|| self.env_value("PATCHBAY_OLLAMA_DEFAULT_MODEL"))
                .unwrap_or_default(),
        }
    }

    /// Resolve `{provider, model}` for a model intent, honoring the
    /// request's `extensions.llm` override first.
    pub fn select_llm(&self, llm_extension: Option<&Map<String, Value>>) -> LlmSelection {
        let ext = llm_extension.cloned().unwrap_or_default();

        let (provider, provider_source) = match ext.get("provider").and_then(Value::as_str) {
            Some(requested) if crate::is_known_provider(requested) => {
                (requested.to_string(), SelectionSource::RequestOverride)
            }
            _ => self.default_provider(),
        };

        let (model, model_source) = match ext
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
        {
            Some(requested) => (requested.to_string(), SelectionSource::RequestOverride),
            None => match self.provider_config_str(&provider, "default_model") {
                Some(configured) => (configured, SelectionSource::UserConfig),
                None => (
                    self.provider_defaults(&provider).default_model,
                    SelectionSource::Env,
                ),
            },
        };

        LlmSelection {
            provider,
            model,
            provider_source,
            model_source,
        }
    }

    /// Check provider prerequisites; `Some(reason)` when unmet.
    pub fn validate_provider_requirements(&self, selection: &LlmSelection) -> Option<String> {
        if selection.provider == PROVIDER_OPENROUTER {
            if self.env_value("PATCHBAY_OPENROUTER_API_KEY").is_none() {
                return Some(
                    "PATCHBAY_OPENROUTER_API_KEY is required for provider openrouter".to_string(),
                );
            }
            if selection.model.is_empty() {
                return Some("Default model is required for provider openrouter".to_string());
            }
            return None;
        }

        if self.provider_defaults(PROVIDER_OLLAMA).base_url.is_empty() {
            return Some("PATCHBAY_OLLAMA_BASE_URL is required for provider ollama".to_string());
        }
        if selection.model.is_empty() {
            return Some("Default model is required for provider ollama".to_string());
        }
        None
    }

    /// The API key for a provider, straight from env. Never logged.
    pub fn provider_api_key(&self, provider: &str) -> Option<String> {
        match provider {
            PROVIDER_OPENROUTER => self.env_value("PATCHBAY_OPENROUTER_API_KEY"),
            PROVIDER_OLLAMA => self.env_value("PATCHBAY_OLLAMA_API_KEY"),
            _ => None,
        }
    }

    /// Observability line describing the active selection. Names required
    /// variables without echoing their values.
    pub fn startup_notice(&self, selection: &LlmSelection) -> String {
        let base = format!(
            "active provider={} ({}), model={} ({})",
            selection.provider,
            selection.provider_source.as_str(),
            selection.model,
            selection.model_source.as_str(),
        );
        if selection.provider == PROVIDER_OPENROUTER {
            format!("{base}; requires PATCHBAY_OPENROUTER_API_KEY")
        } else {
            format!("{base}; requires PATCHBAY_OLLAMA_BASE_URL, PATCHBAY_OLLAMA_API_KEY is optional")
        }
    }
}

/// Whether the name is one of the providers this build can pin to.
pub fn is_known_provider(provider: &str) -> bool {
    provider == PROVIDER_OPENROUTER || provider == PROVIDER_OLLAMA
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resolver(pairs: &[(&str, &str)]) -> ConfigResolver {
        // Point at a nonexistent config so the host user's file never leaks
        // into tests.
        ConfigResolver::new(env(pairs), Some(PathBuf::from("/nonexistent/config.yaml")))
    }

    #[test]
    fn fallback_provider_is_openrouter() {
        let resolver = resolver(&[]);
        let (provider, source) = resolver.default_provider();
        assert_eq!(provider, PROVIDER_OPENROUTER);
        assert_eq!(source, SelectionSource::Fallback);
    }

    #[test]
    fn env_sets_default_provider() {
        let resolver = resolver(&[("PATCHBAY_DEFAULT_PROVIDER", "Ollama")]);
        let (provider, source) = resolver.default_provider();
        assert_eq!(provider, PROVIDER_OLLAMA);
        assert_eq!(source, SelectionSource::Env);
    }

    #[test]
    fn request_override_wins_with_provenance() {
        let resolver = resolver(&[("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "env-model")]);
        let ext = json!({"provider": "ollama", "model": "llama3"});
        let selection = resolver.select_llm(ext.as_object());
        assert_eq!(selection.provider, "ollama");
        assert_eq!(selection.model, "llama3");
        assert_eq!(selection.provider_source, SelectionSource::RequestOverride);
        assert_eq!(selection.model_source, SelectionSource::RequestOverride);
    }

    #[test]
    fn env_model_carries_env_tag() {
        let resolver = resolver(&[("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "env-model")]);
        let selection = resolver.select_llm(None);
        assert_eq!(selection.model, "env-model");
        assert_eq!(selection.model_source, SelectionSource::Env);
    }

    #[test]
    fn user_config_outranks_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "llm:").unwrap();
        writeln!(file, "  default_provider: ollama").unwrap();
        writeln!(file, "  ollama:").unwrap();
        writeln!(file, "    default_model: cfg-model").unwrap();
        drop(file);

        let resolver = ConfigResolver::new(
            env(&[("PATCHBAY_OLLAMA_DEFAULT_MODEL", "env-model")]),
            Some(path),
        );
        let selection = resolver.select_llm(None);
        assert_eq!(selection.provider, "ollama");
        assert_eq!(selection.provider_source, SelectionSource::UserConfig);
        assert_eq!(selection.model, "cfg-model");
        assert_eq!(selection.model_source, SelectionSource::UserConfig);
    }

    #[test]
    fn openrouter_requires_api_key() {
        let resolver = resolver(&[("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "m")]);
        let selection = resolver.select_llm(None);
        let reason = resolver.validate_provider_requirements(&selection).unwrap();
        assert!(reason.contains("PATCHBAY_OPENROUTER_API_KEY"));

        let resolver = resolver_with_key();
        let selection = resolver.select_llm(None);
        assert!(resolver.validate_provider_requirements(&selection).is_none());
    }

    fn resolver_with_key() -> ConfigResolver {
        resolver(&[
            ("PATCHBAY_OPENROUTER_API_KEY", "sk-test"),
            ("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "m"),
        ])
    }

    #[test]
    fn startup_notice_contains_no_secret_values() {
        let resolver = resolver(&[
            ("PATCHBAY_OPENROUTER_API_KEY", "sk-super-secret"),
            ("PATCHBAY_OPENROUTER_DEFAULT_MODEL", "m"),
        ]);
        let selection = resolver.select_llm(None);
        let notice = resolver.startup_notice(&selection);
        assert!(notice.contains("provider=openrouter"));
        assert!(!notice.contains("sk-super-secret"));
    }
}
