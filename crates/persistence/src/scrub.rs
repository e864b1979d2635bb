//! Recursive secret scrubbing applied before any disk write.

use serde_json::{Map, Value};

/// Any mapping key whose lowercased name contains one of these substrings
/// has its value replaced wholesale.
pub const SENSITIVE_KEYS: &[&str] = &["api_key", "authorization", "token", "secret"];

const REDACTED: &str = "<redacted>";

/// Walk the value and redact every entry under a sensitive key name.
/// Matching is by key name only; values are not scanned.
pub fn scrub_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let lowered = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|needle| lowered.contains(needle)) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), scrub_sensitive(item));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub_sensitive).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_at_any_depth() {
        let scrubbed = scrub_sensitive(&json!({
            "api_key": "sk-123",
            "nested": {
                "Authorization": "Bearer abc",
                "nodes": [{"lease_token": "uuid-here", "name": "fine"}],
            },
            "plain": "kept",
        }));

        assert_eq!(scrubbed["api_key"], "<redacted>");
        assert_eq!(scrubbed["nested"]["Authorization"], "<redacted>");
        assert_eq!(scrubbed["nested"]["nodes"][0]["lease_token"], "<redacted>");
        assert_eq!(scrubbed["nested"]["nodes"][0]["name"], "fine");
        assert_eq!(scrubbed["plain"], "kept");
    }

    #[test]
    fn matches_substrings_case_insensitively() {
        let scrubbed = scrub_sensitive(&json!({
            "OPENROUTER_API_KEY": "x",
            "registration_token": "y",
            "client_secret_v2": "z",
        }));
        for key in ["OPENROUTER_API_KEY", "registration_token", "client_secret_v2"] {
            assert_eq!(scrubbed[key], "<redacted>", "{key} should be redacted");
        }
    }

    #[test]
    fn leaves_scalars_and_arrays_alone() {
        let value = json!([1, "two", {"three": 3.0}, null]);
        assert_eq!(scrub_sensitive(&value), value);
    }
}
