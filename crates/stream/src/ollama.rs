//! Minimal native Ollama chat client (`/api/chat`), blocking and
//! line-streamed.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::target::{GenerationOptions, Target};

/// One parsed line of the Ollama streaming response.
#[derive(Debug, Clone)]
pub enum OllamaChunk {
    /// A content delta.
    Token(String),
    /// The final line (`done: true`), carrying `done_reason` and counters.
    Done(Value),
    /// An upstream `{"error": ...}` line.
    UpstreamError(String),
    /// A line that was not valid JSON.
    Malformed(String),
}

pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_body(target: &Target, options: &GenerationOptions, stream: bool) -> Value {
        let mut request_options = json!({"num_predict": options.max_tokens});
        if !options.stop.is_empty() {
            request_options["stop"] = json!(options.stop);
        }
        json!({
            "model": target.model,
            "messages": [
                {"role": "system", "content": target.system_prompt},
                {"role": "user", "content": target.prompt},
            ],
            "stream": stream,
            "options": request_options,
        })
    }

    /// Blocking chat completion. Returns the raw response body.
    pub async fn chat(
        &self,
        target: &Target,
        options: &GenerationOptions,
    ) -> Result<Value, reqwest::Error> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.timeout)
            .json(&Self::chat_body(target, options, false))
            .send()
            .await?
            .error_for_status()?;
        response.json().await
    }

    /// Streaming chat: each JSONL line of the upstream body becomes one
    /// [`OllamaChunk`] on the returned channel. Dropping the receiver
    /// aborts the upstream read. The whole-body timeout is generous: a
    /// token stream legitimately outlives the blocking-call budget.
    pub async fn chat_stream(
        &self,
        target: &Target,
        options: &GenerationOptions,
    ) -> Result<mpsc::Receiver<OllamaChunk>, reqwest::Error> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(Duration::from_secs(600))
            .json(&Self::chat_body(target, options, true))
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            'upstream: while let Some(piece) = body.next().await {
                let Ok(piece) = piece else { break };
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    for chunk in parse_line(&line) {
                        let done = matches!(chunk, OllamaChunk::Done(_));
                        if tx.send(chunk).await.is_err() {
                            // Receiver dropped: client disconnected.
                            break 'upstream;
                        }
                        if done {
                            break 'upstream;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn parse_line(line: &str) -> Vec<OllamaChunk> {
    let Ok(part) = serde_json::from_str::<Value>(line) else {
        return vec![OllamaChunk::Malformed(line.chars().take(200).collect())];
    };
    if let Some(error) = part.get("error") {
        let text = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return vec![OllamaChunk::UpstreamError(text)];
    }

    let mut out = Vec::new();
    let piece = part
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !piece.is_empty() {
        out.push(OllamaChunk::Token(piece.to_string()));
    }
    if part.get("done").and_then(Value::as_bool).unwrap_or(false) {
        out.push(OllamaChunk::Done(part));
    }
    out
}

/// Extract the assistant text from a blocking `/api/chat` response.
pub fn response_text(body: &Value) -> String {
    body.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_and_done_lines() {
        let chunks = parse_line(r#"{"message": {"content": "hel"}, "done": false}"#);
        assert!(matches!(&chunks[..], [OllamaChunk::Token(t)] if t == "hel"));

        let chunks = parse_line(r#"{"message": {"content": ""}, "done": true, "done_reason": "stop"}"#);
        assert!(matches!(&chunks[..], [OllamaChunk::Done(_)]));
    }

    #[test]
    fn final_line_can_carry_both_content_and_done() {
        let chunks = parse_line(r#"{"message": {"content": "lo"}, "done": true}"#);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], OllamaChunk::Token(t) if t == "lo"));
        assert!(matches!(&chunks[1], OllamaChunk::Done(_)));
    }

    #[test]
    fn upstream_errors_and_garbage_are_distinct() {
        let chunks = parse_line(r#"{"error": "model not found"}"#);
        assert!(matches!(&chunks[..], [OllamaChunk::UpstreamError(e)] if e == "model not found"));

        let chunks = parse_line("{not json");
        assert!(matches!(&chunks[..], [OllamaChunk::Malformed(_)]));
    }

    #[test]
    fn blocking_response_text() {
        let body = serde_json::json!({"message": {"content": "hello"}, "done_reason": "stop"});
        assert_eq!(response_text(&body), "hello");
    }
}
