//! Bridge from rig-core completion models to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

/// Wraps any rig `CompletionModel` (Anthropic, OpenAI, ...).
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut builder = AgentBuilder::new(self.model.clone());
        if let Some(system) = request.system_text() {
            builder = builder.preamble(&system);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(t);
        }
        let agent = builder.build();

        // rig folds HTTP status and provider error bodies into the message;
        // the gateway classifies rate limiting from that text.
        let content = agent
            .prompt(request.prompt_text())
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: e.to_string(),
            })?;

        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}
