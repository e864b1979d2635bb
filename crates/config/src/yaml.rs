//! Minimal YAML subset parser for the user config file.
//!
//! Supported constructs: `key: value` string scalars, nested mappings via
//! indentation, `#` comments, blank lines, single/double-quoted scalars.
//! Unsupported (skipped, never mis-parsed): sequences, multi-line scalars,
//! anchors/aliases, flow collections, type tags. All scalar values are
//! strings.

use serde_json::{Map, Value};

/// Parse the supported YAML subset into a nested string map.
pub fn parse_simple_yaml(text: &str) -> Map<String, Value> {
    let mut root = Map::new();
    // Stack of (indent, path-into-root); the root frame sits at depth -1 and
    // is never popped.
    let mut stack: Vec<(i64, Vec<String>)> = vec![(-1, Vec::new())];

    for raw_line in text.lines() {
        if raw_line.trim().is_empty() || raw_line.trim_start().starts_with('#') {
            continue;
        }
        let indent = (raw_line.len() - raw_line.trim_start_matches(' ').len()) as i64;
        let line = raw_line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();

        while stack.len() > 1 && indent <= stack.last().map(|(i, _)| *i).unwrap_or(-1) {
            stack.pop();
        }

        let parent_path = stack.last().map(|(_, p)| p.clone()).unwrap_or_default();
        let parent = resolve_path(&mut root, &parent_path);

        if value.is_empty() {
            parent.insert(key.clone(), Value::Object(Map::new()));
            let mut child_path = parent_path;
            child_path.push(key);
            stack.push((indent, child_path));
        } else {
            parent.insert(key, Value::String(unquote(value)));
        }
    }

    root
}

fn resolve_path<'a>(root: &'a mut Map<String, Value>, path: &[String]) -> &'a mut Map<String, Value> {
    let mut current = root;
    for segment in path {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().unwrap_or_else(|| unreachable!());
    }
    current
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    stripped.unwrap_or(trimmed).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_mappings() {
        let parsed = parse_simple_yaml(
            "llm:\n  default_provider: ollama\n  ollama:\n    base_url: http://localhost:11434/v1\n    default_model: llama3\n",
        );
        assert_eq!(parsed["llm"]["default_provider"], "ollama");
        assert_eq!(parsed["llm"]["ollama"]["base_url"], "http://localhost:11434/v1");
        assert_eq!(parsed["llm"]["ollama"]["default_model"], "llama3");
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let parsed = parse_simple_yaml("# header\n\nname: patchbay\n  # indented comment\n");
        assert_eq!(parsed["name"], "patchbay");
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn strips_quotes_from_scalars() {
        let parsed = parse_simple_yaml("a: \"quoted\"\nb: 'single'\nc: bare\n");
        assert_eq!(parsed["a"], "quoted");
        assert_eq!(parsed["b"], "single");
        assert_eq!(parsed["c"], "bare");
    }

    #[test]
    fn dedent_returns_to_outer_scope() {
        let parsed = parse_simple_yaml("outer:\n  inner: one\ntop: two\n");
        assert_eq!(parsed["outer"]["inner"], "one");
        assert_eq!(parsed["top"], "two");
    }

    #[test]
    fn lines_without_colon_are_skipped() {
        let parsed = parse_simple_yaml("- sequence item\nkey: value\n");
        assert!(!parsed.contains_key("- sequence item"));
        assert_eq!(parsed["key"], "value");
    }
}
