use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// The one seam the pipeline has on the language model: a chat call that
/// returns text. Tests substitute scripted implementations.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl ChatApi for LlmClient {
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest { model, messages };

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = Duration::from_millis(backoff_ms(attempt));
                tokio::time::sleep(backoff).await;
            }
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        tracing::warn!("llm request attempt {attempt}: server error {status}");
                        last_err = Some(anyhow::anyhow!("llm server error: {status}"));
                        continue;
                    }
                    if !status.is_success() {
                        // 4xx: retrying will not help
                        anyhow::bail!("llm request rejected: {status}");
                    }
                    let parsed: ChatResponse = resp.json().await?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .unwrap_or_default();
                    return Ok(content);
                }
                Err(e) => {
                    tracing::warn!("llm request attempt {attempt} failed: {e}");
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("llm request failed")))
    }
}

fn backoff_ms(attempt: u32) -> u64 {
    let base = 500u64 * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::rng().random_range(0..250);
    base + jitter
}

/// Cut a string to at most `max` characters, respecting UTF-8 boundaries.
/// Prompt builders use this to bound article excerpts.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Strip markdown code fences and a leading `json` tag from an LLM reply so
/// the remainder parses as JSON. Models wrap structured answers in fences
/// often enough that every parse site goes through this first.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    let s = s.trim();
    // a bare `json` tag sometimes survives outside the fence
    if let Some(rest) = s.strip_prefix("json\n").or_else(|| s.strip_prefix("json ")) {
        return rest.trim();
    }
    s
}

/// Parse an LLM reply as JSON after fence cleanup. Returns None instead of
/// an error so call sites fall through to their documented fallback.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str(cleaned) {
        Ok(v) => Some(v),
        Err(e) => {
            let head: String = cleaned.chars().take(200).collect();
            tracing::warn!("unparseable llm json ({e}): {head}");
            None
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted chat double: pops queued replies in order, errors when the
    /// script runs dry. Records every prompt it saw.
    pub struct ScriptedChat {
        replies: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedChat {
        pub fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl ChatApi for ScriptedChat {
        async fn chat(&self, messages: &[ChatMessage], _model: &str) -> anyhow::Result<String> {
            let prompt = messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            self.prompts.lock().unwrap().push(prompt);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("scripted chat exhausted"))
        }
    }
}
