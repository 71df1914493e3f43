use std::sync::Arc;
use std::time::Duration;

use crucible_core::RetryConfig;
use crucible_types::CompletionRequest;

use crate::{Provider, ProviderError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub base_timeout: Duration,
    pub complex_timeout: Duration,
    pub complex_threshold_chars: usize,
    pub complex_max_tokens: u32,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            base_timeout: Duration::from_secs(config.base_timeout_secs),
            complex_timeout: Duration::from_secs(config.complex_timeout_secs),
            complex_threshold_chars: config.complex_threshold_chars,
            complex_max_tokens: config.complex_max_tokens,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Large prompts and long generations get the complex timeout.
    pub fn is_complex(&self, request: &CompletionRequest) -> bool {
        request.payload_chars() > self.complex_threshold_chars
            || request
                .max_tokens
                .is_some_and(|tokens| tokens > self.complex_max_tokens)
    }

    pub fn timeout_for(&self, request: &CompletionRequest) -> Duration {
        if self.is_complex(request) {
            self.complex_timeout
        } else {
            self.base_timeout
        }
    }

    /// Delay before retrying after the given 1-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Wraps a provider with per-attempt timeouts, bounded retries and capped
/// exponential backoff.
#[derive(Clone)]
pub struct CompletionClient {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let timeout = self.policy.timeout_for(request);
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let outcome =
                tokio::time::timeout(timeout, self.provider.generate_completion(request)).await;
            let err = match outcome {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(err)) => match err.downcast::<ProviderError>() {
                    Ok(ProviderError::NotConfigured(model)) => {
                        return Err(ProviderError::NotConfigured(model));
                    }
                    Ok(other) => other,
                    Err(err) => ProviderError::Request(format!("{err:#}")),
                },
                Err(_) => ProviderError::Timeout(timeout),
            };
            tracing::warn!(
                model = %request.model_id,
                attempt,
                max_attempts = self.policy.max_attempts,
                error = %err,
                "model call failed"
            );
            last_error = err.to_string();
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }
        Err(ProviderError::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}
