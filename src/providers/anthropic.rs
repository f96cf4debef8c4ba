use async_trait::async_trait;
use serde_json::json;

use super::{status_error, LlmClient};
use crate::error::ProviderError;
use crate::model::{ModelConfig, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request_body(system: &str, user: &str, config: &ModelConfig) -> serde_json::Value {
        json!({
            "model": config.model,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        config: &ModelConfig,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::request_body(system, user, config))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(
                ProviderKind::Anthropic,
                status.as_u16(),
                body,
            ));
        }

        let json: serde_json::Value = resp.json().await?;
        extract_text(&json).ok_or(ProviderError::EmptyResponse {
            provider: ProviderKind::Anthropic,
        })
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }
}

/// Only a leading `text` block counts; tool-use or empty content is an empty reply.
fn extract_text(json: &serde_json::Value) -> Option<String> {
    let block = json.pointer("/content/0")?;
    if block.get("type").and_then(|t| t.as_str()) != Some("text") {
        return None;
    }
    block
        .get("text")
        .and_then(|t| t.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}
