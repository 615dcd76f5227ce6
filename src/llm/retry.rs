//! Model gateway: bounded retry with exponential backoff on rate limits.
//!
//! Only rate-limit signals are retried. Everything else surfaces on the first
//! attempt. Running out of attempts is reported as `NoResponseObtained`, which
//! callers can tell apart from a single-attempt `ModelFault`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{GatewayError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Substrings that mark an upstream error as throttling (matched lowercase).
const RATE_LIMIT_MARKERS: &[&str] = &[
    "resource has been exhausted",
    "resource_exhausted",
    "429",
    "rate limit",
    "rate_limit",
    "too many requests",
];

/// Backoff parameters for the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Factor applied to the delay after every rate-limited attempt.
    pub multiplier: u32,
    /// Upper bound of the uniform random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and local replay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 2,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.min(20));
        self.base_delay.saturating_mul(factor)
    }

    /// Backoff plus random jitter in `[0, max_jitter]`.
    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base.saturating_add(Duration::from_millis(jitter))
    }
}

/// Map one provider failure onto the gateway taxonomy.
pub fn classify(error: &LlmError) -> GatewayError {
    match error {
        LlmError::RateLimited { provider, .. } => {
            GatewayError::RateLimited(format!("{provider} rate limited"))
        }
        LlmError::RequestFailed { reason, .. } if is_rate_limit_signal(reason) => {
            GatewayError::RateLimited(reason.clone())
        }
        LlmError::InvalidResponse { reason, .. } => GatewayError::MalformedUpstream(reason.clone()),
        LlmError::Json(e) => GatewayError::MalformedUpstream(e.to_string()),
        other => GatewayError::ModelFault(other.to_string()),
    }
}

/// Whether an upstream error message carries a known throttling marker.
pub fn is_rate_limit_signal(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// The only path from the dialogue engine to the language model.
///
/// Constructed once at startup and shared by every turn.
pub struct ModelGateway {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    temperature: Option<f64>,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Send `prompt` as a single user message and return the raw model text.
    pub async fn complete(&self, prompt: &str) -> Result<String, GatewayError> {
        let mut request = CompletionRequest::new(vec![ChatMessage::user(prompt)]);
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }

        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            tracing::debug!(
                attempt,
                max_attempts,
                model = %self.provider.model_name(),
                "Sending prompt to model"
            );

            let error = match self.provider.complete(request.clone()).await {
                Ok(response) if response.content.trim().is_empty() => {
                    tracing::error!(attempt, "Model returned an empty completion");
                    return Err(GatewayError::MalformedUpstream(
                        "empty completion".to_string(),
                    ));
                }
                Ok(response) => return Ok(response.content),
                Err(e) => classify(&e),
            };

            match error {
                GatewayError::RateLimited(reason) => {
                    if attempt == max_attempts {
                        tracing::warn!(attempt, max_attempts, %reason, "Rate limited on final attempt");
                        break;
                    }
                    let delay = self.policy.delay_with_jitter(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        %reason,
                        "Model quota reached, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                other => {
                    tracing::error!(attempt, error = %other, "Model call failed");
                    return Err(other);
                }
            }
        }

        tracing::error!(max_attempts, "Retry budget exhausted without a model response");
        Err(GatewayError::NoResponseObtained {
            attempts: max_attempts,
        })
    }
}
