use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::model::{ModelConfig, ProviderKind};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// One chat-completion style text generator.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        config: &ModelConfig,
    ) -> Result<String, ProviderError>;

    fn provider(&self) -> ProviderKind;
}

/// Credentials and endpoints for every provider the service can reach.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
}

impl ProviderSettings {
    pub fn api_key(&self, provider: ProviderKind) -> Option<&str> {
        let key = match provider {
            ProviderKind::OpenAi => self.openai_api_key.as_deref(),
            ProviderKind::Anthropic => self.anthropic_api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }

    /// Build a client for `provider`, preferring an explicit key over the
    /// configured one. Returns `None` when no key is available.
    pub fn client_for(
        &self,
        provider: ProviderKind,
        explicit_key: Option<&str>,
    ) -> Option<Arc<dyn LlmClient>> {
        let key = explicit_key
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key(provider))?
            .to_string();

        let client: Arc<dyn LlmClient> = match provider {
            ProviderKind::OpenAi => {
                let mut c = OpenAiClient::new(key);
                if let Some(url) = &self.openai_base_url {
                    c = c.with_base_url(url.clone());
                }
                Arc::new(c)
            }
            ProviderKind::Anthropic => {
                let mut c = AnthropicClient::new(key);
                if let Some(url) = &self.anthropic_base_url {
                    c = c.with_base_url(url.clone());
                }
                Arc::new(c)
            }
        };
        Some(client)
    }
}

pub(crate) fn status_error(provider: ProviderKind, status: u16, body: String) -> ProviderError {
    if status == 401 || status == 403 {
        ProviderError::Auth { provider }
    } else {
        ProviderError::Api {
            provider,
            status,
            message: body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_for_without_key() {
        let settings = ProviderSettings::default();
        assert!(settings.client_for(ProviderKind::OpenAi, None).is_none());
        assert!(settings.client_for(ProviderKind::Anthropic, Some("  ")).is_none());
    }

    #[test]
    fn test_client_for_prefers_explicit_key() {
        let settings = ProviderSettings::default();
        let client = settings
            .client_for(ProviderKind::Anthropic, Some("sk-ant"))
            .unwrap();
        assert_eq!(client.provider(), ProviderKind::Anthropic);
    }

    #[test]
    fn test_client_for_uses_configured_key() {
        let settings = ProviderSettings {
            openai_api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let client = settings.client_for(ProviderKind::OpenAi, None).unwrap();
        assert_eq!(client.provider(), ProviderKind::OpenAi);
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(ProviderKind::OpenAi, 401, String::new()),
            ProviderError::Auth { .. }
        ));
        assert!(matches!(
            status_error(ProviderKind::Anthropic, 429, "slow down".into()),
            ProviderError::Api { status: 429, .. }
        ));
    }
}
