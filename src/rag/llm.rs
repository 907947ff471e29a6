use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Settings;
use crate::error::{ConfigError, LlmError};

/// Request envelope shared by language-model implementations.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

/// A single completion call. Retries belong to the caller.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// Chat-completions client for OpenRouter and other OpenAI-compatible endpoints.
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatibleModel {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        referer: &str,
        app_title: &str,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        if !api_key.trim().is_empty() {
            let auth = format!("Bearer {}", api_key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).map_err(|_| ConfigError("invalid llm_api_key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // OpenRouter attribution headers.
        if !referer.is_empty() {
            headers.insert(
                "http-referer",
                HeaderValue::from_str(referer).map_err(|_| ConfigError("invalid llm_http_referer".into()))?,
            );
        }
        if !app_title.is_empty() {
            headers.insert(
                "x-title",
                HeaderValue::from_str(app_title).map_err(|_| ConfigError("invalid llm_app_title".into()))?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError(format!("failed to build LLM HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            timeout,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::new(
            &settings.llm_base_url,
            &settings.llm_api_key,
            &settings.llm_model_name,
            &settings.llm_http_referer,
            &settings.llm_app_title,
            settings.llm_timeout(),
        )
    }

    async fn call(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(LlmError::RateLimited(text));
            }
            return Err(LlmError::Http { status: status.as_u16(), body: text });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| LlmError::Malformed(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("response has no choices".into()))?;
        Ok(choice.message.content.unwrap_or_default().trim().to_string())
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let raw = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"  Limbe. "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("  Limbe. "));

        let null_content = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(null_content).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[test]
    fn test_request_shape() {
        let body = ChatRequest {
            model: "mistralai/mistral-7b-instruct",
            temperature: 0.0,
            messages: vec![ChatMessage { role: "system", content: "rules" }, ChatMessage { role: "user", content: "q" }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "mistralai/mistral-7b-instruct");
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn test_rejects_bad_header_values() {
        let err = OpenAiCompatibleModel::new("https://openrouter.ai/api/v1", "key\nwith newline", "m", "", "", Duration::from_secs(5));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let model = OpenAiCompatibleModel::new("http://127.0.0.1:1/v1", "k", "m", "", "sitekb", Duration::from_secs(5)).unwrap();
        let req = CompletionRequest { system: "s".into(), user: "u".into(), temperature: 0.0 };
        let err = model.complete(&req).await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
        assert!(err.is_retryable());
    }
}
