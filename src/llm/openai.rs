//! OpenAI-compatible chat-completions backend over reqwest.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

const PROVIDER: &str = "openai";

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: SecretString, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn invalid(reason: impl Into<String>) -> LlmError {
    LlmError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason: reason.into(),
    }
}

fn parse_chat_response(body: &str) -> Result<CompletionResponse, LlmError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| invalid(format!("undecodable body: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| invalid("no choices"))?;
    let usage = parsed.usage.unwrap_or(Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        response_id: parsed.id,
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            response_format: request
                .json_output
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        match status.as_u16() {
            200..=299 => {}
            401 | 403 => {
                return Err(LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                });
            }
            429 => {
                return Err(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                });
            }
            code => {
                return Err(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("HTTP {code}: {text}"),
                });
            }
        }

        let completion = parse_chat_response(&text)?;
        debug!(
            model = %self.model,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "Completion received"
        );
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_json_mode() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: Some(0.2),
            response_format: Some(ResponseFormat { kind: "json_object" }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn response_content_and_usage_extracted() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "{\"category\":\"task\"}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        }"#;
        let resp = parse_chat_response(body).unwrap();
        assert_eq!(resp.content, r#"{"category":"task"}"#);
        assert_eq!(resp.input_tokens, 12);
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.response_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn empty_choices_is_invalid() {
        assert!(matches!(
            parse_chat_response(r#"{"choices": []}"#),
            Err(LlmError::InvalidResponse { .. })
        ));
    }
}
