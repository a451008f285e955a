//! OpenAI-compatible AI provider.
//!
//! Covers any backend that exposes an OpenAI-compatible chat completions
//! endpoint (OpenAI, OpenRouter, Anthropic via OpenRouter, DeepSeek, Groq,
//! Gemini's OpenAI-compatible surface, vLLM / any local server). Direct
//! HTTP via `reqwest`, no SDK dependency, same as the teacher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{RouteSuggestion, ShellActionPlan};
use super::AiChatProvider;

const PROVIDER_URLS: &[(&str, &str)] = &[
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("openai", "https://api.openai.com/v1"),
    ("anthropic", "https://api.anthropic.com/v1"),
    ("deepseek", "https://api.deepseek.com/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
    ("gemini", "https://generativelanguage.googleapis.com/v1beta/openai"),
];

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 500;

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(provider_name: &str, api_key: &str, api_base: Option<&str>, default_model: &str, client: Client) -> Self {
        let base_url = api_base
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                PROVIDER_URLS
                    .iter()
                    .find(|(name, _)| *name == provider_name)
                    .map(|(_, url)| url.to_string())
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            })
            .trim_end_matches('/')
            .to_string();

        debug!(provider = provider_name, base_url = %base_url, "initialized AI provider");

        Self { client, api_key: api_key.to_string(), base_url, default_model: default_model.to_string() }
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
    }

    /// Sends a single-turn chat completion and returns the raw assistant
    /// message content, retrying transient failures with exponential
    /// backoff.
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_body = CompletionRequest {
            model: &self.default_model,
            messages: &[Message { role: "system", content: system }, Message { role: "user", content: user }],
            max_tokens: 1024,
            temperature: 0.2,
        };

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_DELAY_MS * 2u64.pow(attempt - 1);
                warn!(attempt, delay_ms = delay, "retrying AI API request");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let result = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request_body)
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, error = %e, "network error calling AI API");
                    last_error = Some(e.into());
                    continue;
                }
            };

            let status = response.status();
            let body = response.text().await.context("failed to read AI API response body")?;

            if !status.is_success() {
                let err_msg = serde_json::from_str::<ErrorResponse>(&body).map(|e| e.message()).unwrap_or_else(|_| body.clone());

                if Self::is_retryable_status(status) {
                    warn!(attempt, status = %status, "transient AI API error, will retry");
                    last_error = Some(anyhow::anyhow!("AI API error ({}): {}", status, err_msg));
                    continue;
                }

                anyhow::bail!("AI API error ({}): {}", status, err_msg);
            }

            let completion: CompletionResponse = serde_json::from_str(&body).context("failed to parse AI API response")?;
            let choice = completion.choices.into_iter().next().context("AI API returned no choices")?;
            return Ok(choice.message.content.unwrap_or_default());
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("AI API request failed after {} retries", MAX_RETRIES)))
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message<'a>],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorResponse {
    Single(ErrorBody),
    Multiple(Vec<ErrorBody>),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorResponse {
    fn message(&self) -> String {
        match self {
            Self::Single(b) => b.error.message.clone(),
            Self::Multiple(v) => v.first().map(|b| b.error.message.clone()).unwrap_or_else(|| "unknown error".into()),
        }
    }
}

fn strip_code_fence(raw: &str) -> &str {
    raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim()
}

#[async_trait]
impl AiChatProvider for OpenAiProvider {
    async fn ask(&self, prompt: &str) -> Result<String> {
        self.complete("Respondé de forma breve y directa.", prompt).await
    }

    async fn plan_shell_action(&self, text: &str) -> Result<ShellActionPlan> {
        let system = "Respondé únicamente con JSON {\"commandLine\": string, \"reason\": string}.";
        let raw = self.complete(system, text).await?;
        serde_json::from_str(strip_code_fence(&raw)).context("failed to parse shell action plan")
    }

    async fn classify_sequence_steps(&self, text: &str) -> Result<Vec<String>> {
        let system = "Dividí el pedido en pasos ordenados. Respondé únicamente con un array JSON de strings.";
        let raw = self.complete(system, text).await?;
        serde_json::from_str(strip_code_fence(&raw)).context("failed to parse sequence steps")
    }

    async fn suggest_route(&self, text: &str, candidates: &[String]) -> Result<RouteSuggestion> {
        let system = format!(
            "Elegí exactamente uno de estos handlers: {}. Respondé únicamente con JSON {{\"handler\": string, \"reason\": string}}.",
            candidates.join(", ")
        );
        let raw = self.complete(&system, text).await?;
        serde_json::from_str(strip_code_fence(&raw)).context("failed to parse route suggestion")
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_url_lookup() {
        let client = Client::new();
        let p = OpenAiProvider::new("openrouter", "test-key", None, "test-model", client.clone());
        assert_eq!(p.base_url, "https://openrouter.ai/api/v1");

        let p = OpenAiProvider::new("deepseek", "test-key", None, "test-model", client);
        assert_eq!(p.base_url, "https://api.deepseek.com/v1");
    }

    #[test]
    fn test_custom_base_url() {
        let p = OpenAiProvider::new("vllm", "dummy", Some("http://localhost:8000/v1"), "llama-3", Client::new());
        assert_eq!(p.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn test_retryable_status() {
        assert!(OpenAiProvider::is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(OpenAiProvider::is_retryable_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!OpenAiProvider::is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(!OpenAiProvider::is_retryable_status(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_strip_code_fence_removes_markdown_wrapper() {
        assert_eq!(strip_code_fence("```json\n[\"a\",\"b\"]\n```"), "[\"a\",\"b\"]");
        assert_eq!(strip_code_fence("[\"a\"]"), "[\"a\"]");
    }
}
