//! The text-completion collaborator.
//!
//! The engine treats the provider as "text in, text out". Everything that
//! talks to a model goes through [`TextCompletion`]; production code wraps the
//! provider in [`ResilientCompletion`] for timeouts and retries.

mod anthropic;

pub use self::anthropic::{ClaudeCompletion, ClaudeFactory};

use crate::config::CompletionConfig;
use crate::error::{CompletionError, CompletionResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_instruction: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: Option<usize>,
}

impl CompletionRequest {
    pub fn new(system_instruction: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.7,
            max_output_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: usize) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }
}

/// A text-completion service.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Complete a prompt. Empty output is an error.
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult<String>;
}

/// Builds completion clients from configuration.
///
/// Passed into a [`Session`](crate::session::Session) at construction so no
/// client handle is ever process-global.
pub trait ClientFactory: Send + Sync {
    fn build(&self, config: &CompletionConfig) -> CompletionResult<Arc<dyn TextCompletion>>;
}

/// Retry and backoff policy for completion calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CompletionConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &CompletionConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// A policy that retries without sleeping. Used in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries,
            base_backoff: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based) after `error`.
    ///
    /// `base * 2^attempt`, capped at `max_backoff`. Rate limits start from the
    /// longer base and honour the provider's `retry_after` up to the same cap.
    pub fn backoff_for(&self, attempt: u32, error: &CompletionError) -> Duration {
        let base = if error.is_rate_limit() {
            self.rate_limit_backoff
        } else {
            self.base_backoff
        };
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let delay = base.saturating_mul(factor).min(self.max_backoff);
        match error {
            CompletionError::RateLimited {
                retry_after: Some(after),
            } => delay.max(*after).min(self.max_backoff),
            _ => delay,
        }
    }
}

/// Wraps a completion service with per-attempt timeouts and capped retries.
pub struct ResilientCompletion {
    inner: Arc<dyn TextCompletion>,
    policy: RetryPolicy,
}

impl ResilientCompletion {
    pub fn new(inner: Arc<dyn TextCompletion>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(&self, request: &CompletionRequest) -> CompletionResult<String> {
        let text = tokio::time::timeout(self.policy.timeout, self.inner.complete(request))
            .await
            .map_err(|_| CompletionError::Timeout {
                duration: self.policy.timeout,
            })??;
        if text.trim().is_empty() {
            return Err(CompletionError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl TextCompletion for ResilientCompletion {
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult<String> {
        let mut attempt = 0;
        loop {
            match self.attempt(request).await {
                Ok(text) => return Ok(text),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.policy.max_retries => {
                    return Err(CompletionError::Exhausted {
                        attempts: attempt + 1,
                        last: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.policy.backoff_for(attempt, &err);
                    warn!(attempt = attempt + 1, ?delay, error = %err, "Completion failed, retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
