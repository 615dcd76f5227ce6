//! Google Gemini provider, calling `generateContent` directly over reqwest.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini REST client bound to one model.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.trim_start_matches("models/").to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{DEFAULT_BASE_URL}/models/{}:generateContent", self.model)
    }
}

/// Build the JSON body for a `generateContent` call.
fn request_body(request: &CompletionRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.prompt_text() }]
        }]
    });

    if let Some(system) = request.system_text() {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), serde_json::json!(t));
    }
    if !generation.is_empty() {
        body["generationConfig"] = serde_json::Value::Object(generation);
    }

    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// Decode a successful `generateContent` body into a `CompletionResponse`.
fn parse_response(body: &str) -> Result<CompletionResponse, LlmError> {
    let parsed: GenerateResponse = serde_json::from_str(body)?;

    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: "gemini".to_string(),
            reason: "response carried no candidates".to_string(),
        })?;

    let content = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let finish_reason = match candidate.finish_reason.as_deref() {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") => FinishReason::Safety,
        _ => FinishReason::Unknown,
    };

    let (input_tokens, output_tokens) = parsed
        .usage_metadata
        .map(|u| (u.prompt_token_count, u.candidates_token_count))
        .unwrap_or((0, 0));

    Ok(CompletionResponse {
        content,
        input_tokens,
        output_tokens,
        finish_reason,
        response_id: parsed.response_id,
    })
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request_body(&request))
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "gemini".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: "gemini".to_string(),
            reason: format!("failed to read body: {e}"),
        })?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited {
                provider: "gemini".to_string(),
                retry_after: None,
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LlmError::AuthFailed {
                provider: "gemini".to_string(),
            });
        }
        if !status.is_success() {
            return Err(LlmError::RequestFailed {
                provider: "gemini".to_string(),
                reason: format!("HTTP {status}: {body}"),
            });
        }

        let parsed = parse_response(&body)?;
        tracing::debug!(
            model = %self.model,
            input_tokens = parsed.input_tokens,
            output_tokens = parsed.output_tokens,
            "Gemini completion received"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn body_carries_prompt_and_temperature() {
        let request = CompletionRequest::new(vec![ChatMessage::user("Cliente: Hola")])
            .with_temperature(0.7);
        let body = request_body(&request);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Cliente: Hola");
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn body_includes_system_instruction() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("Eres un asistente"),
            ChatMessage::user("Hola"),
        ]);
        let body = request_body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Eres un asistente");
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn parses_candidate_text_and_usage() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "{\"respuesta\": \"Hola\","}, {"text": " \"step\": 1}"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 14},
            "responseId": "abc"
        }"#;
        let response = parse_response(raw).unwrap();
        assert_eq!(response.content, r#"{"respuesta": "Hola", "step": 1}"#);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.input_tokens, 120);
        assert_eq!(response.output_tokens, 14);
        assert_eq!(response.response_id.as_deref(), Some("abc"));
    }

    #[test]
    fn no_candidates_is_invalid_response() {
        let err = parse_response(r#"{"candidates": []}"#).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn model_prefix_is_stripped() {
        let provider = GeminiProvider::new(SecretString::from("k"), "models/gemini-2.0-flash");
        assert_eq!(provider.model_name(), "gemini-2.0-flash");
        assert_eq!(
            provider.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }
}
