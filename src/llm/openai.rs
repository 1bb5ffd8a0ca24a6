//! OpenAI chat-completions provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const PROVIDER: &str = "openai";

/// OpenAI API provider.
pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(
        api_key: SecretString,
        model: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url,
        })
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

/// Map a non-success status and body to a provider error.
fn status_error(status: StatusCode, body: &str) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider: PROVIDER.to_string(),
        },
        _ => {
            let reason = serde_json::from_str::<OpenAiError>(body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}"));
            LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason,
            }
        }
    }
}

fn into_completion(response: OpenAiResponse) -> Result<CompletionResponse, LlmError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "No choices in response".to_string(),
        })?;
    let (input_tokens, output_tokens) = response
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        input_tokens,
        output_tokens,
        finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = OpenAiRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let parsed: OpenAiResponse = response.json().await?;
        let completion = into_completion(parsed)?;
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
    fn request_serializes_roles_lowercase() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let body = OpenAiRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: Some(500),
            temperature: Some(0.0),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 500);
    }

    #[test]
    fn response_maps_first_choice() {
        let raw = r#"{
            "choices": [{"message": {"content": "{\"category\":\"Other\"}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7}
        }"#;
        let parsed: OpenAiResponse = serde_json::from_str(raw).unwrap();
        let completion = into_completion(parsed).unwrap();
        assert_eq!(completion.content, r#"{"category":"Other"}"#);
        assert_eq!(completion.input_tokens, 12);
        assert_eq!(completion.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn empty_choices_is_invalid_response() {
        let parsed: OpenAiResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            into_completion(parsed),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn status_errors_are_classified() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::RateLimited { .. }
        ));
        let err = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"error": {"message": "model not found"}}"#,
        );
        assert!(matches!(err, LlmError::RequestFailed { ref reason, .. } if reason == "model not found"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let provider = OpenAiProvider::new(
            SecretString::from("sk-test"),
            "gpt-4o-mini",
            Some("http://localhost:8080/v1/".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
        assert_eq!(provider.model_name(), "gpt-4o-mini");
    }
}
