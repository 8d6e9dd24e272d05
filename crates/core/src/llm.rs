use crate::config::{endpoint_url, LlmConfig};
use crate::error::{ConfigError, GenerationError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Sends one prompt and returns the raw completion text.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[async_trait]
impl<T: ChatModel + ?Sized> ChatModel for Arc<T> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        (**self).generate(prompt).await
    }
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    temperature: f32,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl OpenAiChatModel {
    /// Reads the key from `OPENAI_API_KEY`.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key()?;
        Self::new(config, api_key)
    }

    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential(crate::config::OPENAI_API_KEY_ENV));
        }
        config.validate()?;

        let endpoint = endpoint_url(&config.endpoint)?.join("chat/completions")?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| ConfigError::InvalidValue {
                field: "llm.endpoint",
                details: error.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        debug!(model = %self.model, prompt_chars = prompt.len(), "calling chat completion");

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                temperature: self.temperature,
                messages: [ChatMessage {
                    role: "user",
                    content: prompt,
                }],
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::BackendResponse {
                backend: self.endpoint.to_string(),
                details: format!("{status}: {body}"),
            });
        }

        completion_text(&body)
    }
}

fn completion_text(body: &str) -> Result<String, GenerationError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|error| GenerationError::Unparseable(format!("invalid json: {error}")))?;

    parsed
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            GenerationError::Unparseable("response has no choices[0].message.content".to_string())
        })
}
