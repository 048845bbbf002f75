//! Anthropic Claude implementation of [`TextCompletion`].

use super::{ClientFactory, CompletionRequest, RetryPolicy, ResilientCompletion, TextCompletion};
use crate::config::CompletionConfig;
use crate::error::{CompletionError, CompletionResult};
use async_trait::async_trait;
use claude::{Claude, Message, Request};
use std::sync::Arc;

/// Default output budget when a request does not set one.
const DEFAULT_MAX_TOKENS: usize = 8192;

/// Claude-backed completion service.
pub struct ClaudeCompletion {
    client: Claude,
}

impl ClaudeCompletion {
    pub fn new(client: Claude) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TextCompletion for ClaudeCompletion {
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult<String> {
        let api_request = Request::new(vec![Message::user(request.user_prompt.clone())])
            .with_system(request.system_instruction.clone())
            .with_temperature(request.temperature)
            .with_max_tokens(request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS));

        let response = self.client.complete(api_request).await?;
        if response.text.trim().is_empty() {
            return Err(CompletionError::Empty);
        }
        Ok(response.text)
    }
}

/// Builds a retrying Claude client from [`CompletionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClaudeFactory;

impl ClientFactory for ClaudeFactory {
    fn build(&self, config: &CompletionConfig) -> CompletionResult<Arc<dyn TextCompletion>> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            CompletionError::Configuration(format!("{} not set", config.api_key_env))
        })?;
        let client = Claude::with_timeout(api_key, config.timeout())?.with_model(config.model.clone());
        let resilient = ResilientCompletion::new(
            Arc::new(ClaudeCompletion::new(client)),
            RetryPolicy::from_config(config),
        );
        Ok(Arc::new(resilient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_requires_key() {
        let config = CompletionConfig {
            api_key_env: "SAGA_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..CompletionConfig::default()
        };
        let err = ClaudeFactory.build(&config).err().unwrap();
        assert!(matches!(err, CompletionError::Configuration(_)));
    }
}
