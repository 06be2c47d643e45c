use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::outbound::{create_http_client, CORRELATION_ID_HEADER};

/// Chat-style completion service used to generate reviews.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Send one system instruction and one user document, returning the
    /// model's single text reply.
    async fn complete(
        &self,
        correlation_id: Option<&str>,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct CompletionClient {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    pub content: Option<String>,
}

impl ChatCompletionRequest {
    pub fn new(model: &str, system_prompt: &str, user_prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
        }
    }
}

impl ChatCompletionResponse {
    /// Text of the first choice. An absent or blank reply is an error, since
    /// posting it would leave an empty comment on the PR.
    pub fn into_text(self) -> Result<String> {
        let content = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Completion response contained no choices"))?
            .message
            .content
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(anyhow!("Completion response was empty"));
        }
        Ok(content)
    }
}

impl CompletionClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Result<Self> {
        Ok(Self {
            client: create_http_client("completion")?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionService for CompletionClient {
    async fn complete(
        &self,
        correlation_id: Option<&str>,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_body = ChatCompletionRequest::new(&self.model, system_prompt, user_prompt);

        info!(
            "Requesting completion from {} ({} prompt bytes)",
            self.model,
            user_prompt.len()
        );

        let mut request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&request_body)?);

        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request_builder
            .send()
            .await
            .context("Failed to send completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("Completion API error: {} - {}", status, error_text);
            return Err(anyhow!("Completion API error: {} - {}", status, error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        let text = completion.into_text()?;
        info!("Received completion ({} bytes)", text.len());
        Ok(text)
    }
}
