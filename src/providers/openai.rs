use async_trait::async_trait;
use serde_json::json;

use super::{status_error, LlmClient};
use crate::error::ProviderError;
use crate::model::{ModelConfig, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiClient {
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
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "top_p": config.top_p,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        config: &ModelConfig,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(system, user, config))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(ProviderKind::OpenAi, status.as_u16(), body));
        }

        let json: serde_json::Value = resp.json().await?;
        extract_content(&json).ok_or(ProviderError::EmptyResponse {
            provider: ProviderKind::OpenAi,
        })
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }
}

fn extract_content(json: &serde_json::Value) -> Option<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let cfg = ModelConfig::new(ProviderKind::OpenAi, "gpt-4o").with_max_tokens(512);
        let body = OpenAiClient::request_body("be terse", "hello", &cfg);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn test_extract_content() {
        let ok = json!({"choices": [{"message": {"content": "Score: 8"}}]});
        assert_eq!(extract_content(&ok).as_deref(), Some("Score: 8"));

        let empty = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(extract_content(&empty).is_none());

        assert!(extract_content(&json!({})).is_none());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let c = OpenAiClient::new("k".into()).with_base_url("http://localhost:9000/v1/");
        assert_eq!(c.base_url, "http://localhost:9000/v1");
    }
}
