use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::error::{RecurseError, RecurseResult};
use crate::types::*;

use super::traits::Provider;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible `/v1/chat/completions` client.
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound every request; the pool applies its own per-call ceiling on top.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.client = Client::builder()
            .timeout(Duration::from_secs(secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        self
    }

    /// Reads `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> RecurseResult<Self> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RecurseError::Config("OPENAI_API_KEY is not set".into()))?;
        let provider = Self::new(key);
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => provider.with_base_url(url),
            _ => provider,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, messages: &[Message], model: &str) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();
        json!({
            "model": model,
            "messages": api_messages,
        })
    }

    fn parse_response(&self, data: &serde_json::Value, model: &str) -> RecurseResult<Message> {
        let content = data
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| RecurseError::Provider("completion response has no message content".into()))?;

        let mut usage = TokenUsage::default();
        if let Some(u) = data.get("usage") {
            if let Some(inp) = u.get("prompt_tokens").and_then(|v| v.as_u64()) {
                usage.input_tokens = inp as usize;
            }
            if let Some(out) = u.get("completion_tokens").and_then(|v| v.as_u64()) {
                usage.output_tokens = out as usize;
            }
        }

        let mut msg = Message::assistant(content);
        msg.model = Some(model.to_string());
        msg.usage = Some(usage);
        Ok(msg)
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, messages: &[Message], model: &str) -> RecurseResult<Message> {
        let body = self.build_body(messages, model);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000);
            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(RecurseError::RateLimited {
                    provider: "openai".into(),
                    retry_after_ms,
                });
            }
            return Err(RecurseError::Provider(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let data: serde_json::Value = response.json().await?;
        self.parse_response(&data, model)
    }
}
