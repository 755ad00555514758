// =============================================================================
// LLM Gateway — request/response contract with retry over two dialects
// =============================================================================
//
// Contract: given a system prompt and a user prompt, return the raw response
// text or a typed transport error. The provider dialect (chat-completions or
// assistant/thread) is a construction parameter and not visible to callers;
// traders hold the gateway as `Arc<dyn LlmGateway>` so tests can supply fakes.
//
// Retry policy: up to five attempts, failing fast on non-retryable errors
// (malformed credentials, 4xx other than 408/429). Between attempts the
// gateway waits 2·2^(attempt−1) seconds, capped at 30 s. Total wall time is
// bounded only by per-attempt timeout × attempt count.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Attempts per call.
const MAX_ATTEMPTS: u32 = 5;

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Backoff ceiling between attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default completion budget; overridden by `AI_MAX_TOKENS`.
const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Sampling temperature for decision calls.
const TEMPERATURE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transient: connection reset/closed, timeout, DNS, stream errors,
    /// 408/429, any 5xx.
    #[error("llm transport: {0}")]
    Transport(String),

    /// Permanent for this request: malformed credentials or any other 4xx.
    #[error("llm request rejected: {0}")]
    Rejected(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// ---------------------------------------------------------------------------
// Gateway capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// One decision call: `(system_prompt, user_prompt) → response text`.
    async fn complete(&self, system_prompt: &str, user_prompt: &str)
        -> Result<String, LlmError>;
}

/// Provider wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// OpenAI-compatible `/chat/completions`.
    ChatCompletions,
    /// Assistant/thread-shaped, with an optional sticky thread id.
    AssistantThread,
}

impl Default for Dialect {
    fn default() -> Self {
        Self::ChatCompletions
    }
}

/// Completion token budget from `AI_MAX_TOKENS` (positive integer).
pub fn ai_max_tokens() -> u32 {
    std::env::var("AI_MAX_TOKENS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_TOKENS)
}

/// Backoff before attempt `attempt + 1` (attempts count from 1).
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_mul(1 << (attempt.saturating_sub(1)).min(10));
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

/// Classify an HTTP status into retryable / fatal.
fn status_retryable(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

/// HTTP-backed gateway speaking one of the two dialects.
pub struct HttpLlmGateway {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    dialect: Dialect,
    /// Sticky thread id for the assistant dialect. Seeded from configuration,
    /// replaced once a thread is created.
    thread_id: RwLock<Option<String>>,
    max_tokens: u32,
}

impl HttpLlmGateway {
    /// # Arguments
    /// * `api_key`  — bearer credential; never logged.
    /// * `model`    — provider model name.
    /// * `endpoint` — base URL override; defaults to the OpenAI API.
    /// * `dialect`  — wire shape.
    /// * `thread_id` — optional sticky thread for the assistant dialect.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        endpoint: Option<String>,
        dialect: Dialect,
        thread_id: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client for LLM gateway");

        let base_url = endpoint
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url,
            dialect,
            thread_id: RwLock::new(thread_id),
            max_tokens: ai_max_tokens(),
        }
    }

    async fn attempt(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        match self.dialect {
            Dialect::ChatCompletions => self.chat_completion(system_prompt, user_prompt).await,
            Dialect::AssistantThread => self.assistant_run(system_prompt, user_prompt).await,
        }
    }

    // -- chat-completions dialect ---------------------------------------------

    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: Some(TEMPERATURE),
            max_tokens: Some(self.max_tokens),
        };

        let body = self
            .post_json(&format!("{}/chat/completions", self.base_url), &req)
            .await?;

        let parsed: ChatCompletionResponse = serde_json::from_value(body)
            .map_err(|e| LlmError::Transport(format!("chat completion parse: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| LlmError::Transport("empty completion".to_string()))
    }

    // -- assistant/thread dialect ---------------------------------------------

    async fn assistant_run(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let existing_thread_id = self.thread_id.read().clone();
        let thread_id = match existing_thread_id {
            Some(id) => id,
            None => {
                let body = self
                    .post_json(&format!("{}/threads", self.base_url), &serde_json::json!({}))
                    .await?;
                let id = body["id"]
                    .as_str()
                    .ok_or_else(|| LlmError::Transport("thread create: missing id".into()))?
                    .to_string();
                debug!(thread_id = %id, "assistant thread created");
                *self.thread_id.write() = Some(id.clone());
                id
            }
        };

        self.post_json(
            &format!("{}/threads/{}/messages", self.base_url, thread_id),
            &serde_json::json!({ "role": "user", "content": user_prompt }),
        )
        .await?;

        let run = self
            .post_json(
                &format!("{}/threads/{}/runs", self.base_url, thread_id),
                &serde_json::json!({
                    "model": self.model,
                    "instructions": system_prompt,
                    "max_completion_tokens": self.max_tokens,
                }),
            )
            .await?;
        let run_id = run["id"]
            .as_str()
            .ok_or_else(|| LlmError::Transport("run create: missing id".into()))?
            .to_string();

        // Poll the run to completion inside this attempt's wall clock.
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let status_body = self
                .get_json(&format!(
                    "{}/threads/{}/runs/{}",
                    self.base_url, thread_id, run_id
                ))
                .await?;
            match status_body["status"].as_str().unwrap_or("") {
                "completed" => {
                    let messages = self
                        .get_json(&format!(
                            "{}/threads/{}/messages?limit=1",
                            self.base_url, thread_id
                        ))
                        .await?;
                    let text = messages["data"][0]["content"][0]["text"]["value"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    if text.is_empty() {
                        return Err(LlmError::Transport("empty assistant reply".into()));
                    }
                    return Ok(text);
                }
                "failed" | "cancelled" | "expired" => {
                    return Err(LlmError::Transport(format!(
                        "assistant run ended as {}",
                        status_body["status"]
                    )));
                }
                _ => {}
            }
        }
        Err(LlmError::Transport("assistant run polling timed out".into()))
    }

    // -- transport helpers ----------------------------------------------------

    async fn post_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<serde_json::Value, LlmError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(format!("{url}: {e}")))?;
        Self::read_response(url, resp).await
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, LlmError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await
            .map_err(|e| LlmError::Transport(format!("{url}: {e}")))?;
        Self::read_response(url, resp).await
    }

    async fn read_response(
        url: &str,
        resp: reqwest::Response,
    ) -> Result<serde_json::Value, LlmError> {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            return serde_json::from_str(&text)
                .map_err(|e| LlmError::Transport(format!("{url}: body parse: {e}")));
        }

        let snippet: String = text.chars().take(400).collect();
        if status_retryable(status) {
            Err(LlmError::Transport(format!("{url} returned {status}: {snippet}")))
        } else {
            Err(LlmError::Rejected(format!("{url} returned {status}: {snippet}")))
        }
    }
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let mut last_err = LlmError::Transport("no attempt made".to_string());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(system_prompt, user_prompt).await {
                Ok(text) => {
                    debug!(attempt, chars = text.len(), "llm response received");
                    return Ok(text);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    last_err = e;
                    if attempt < MAX_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        warn!(
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %last_err,
                            "llm attempt failed — retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_err)
    }
}

impl std::fmt::Debug for HttpLlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlmGateway")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dialect", &self.dialect)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs (chat-completions dialect)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}


// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30)); // 32 capped
        assert_eq!(backoff_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn status_classification() {
        assert!(status_retryable(408));
        assert!(status_retryable(429));
        assert!(status_retryable(500));
        assert!(status_retryable(503));
        assert!(!status_retryable(400));
        assert!(!status_retryable(401));
        assert!(!status_retryable(404));
    }

    #[test]
    fn max_tokens_default() {
        // Unless the env override is set, the default budget applies.
        if std::env::var("AI_MAX_TOKENS").is_err() {
            assert_eq!(ai_max_tokens(), DEFAULT_MAX_TOKENS);
        }
    }

    #[test]
    fn gateway_debug_redacts_key() {
        let gw = HttpLlmGateway::new(
            "sk-sensitive",
            "gpt-test",
            None,
            Dialect::ChatCompletions,
            None,
        );
        let rendered = format!("{gw:?}");
        assert!(!rendered.contains("sk-sensitive"));
    }

    #[tokio::test]
    async fn scripted_gateway_replays_in_order() {
        use mock::ScriptedGateway;
        let gw = ScriptedGateway::new().reply("first").fail("boom");
        assert_eq!(gw.complete("s", "u").await.unwrap(), "first");
        assert!(gw.complete("s", "u").await.is_err());
    }
}
