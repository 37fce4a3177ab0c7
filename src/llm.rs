// Thin client for an OpenAI-compatible chat-completion and embedding API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse API response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("API response contained no {0}")]
    Empty(&'static str),
}

/// Role of a message sent to the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<crate::message::Role> for ChatRole {
    fn from(role: crate::message::Role) -> Self {
        match role {
            crate::message::Role::User => ChatRole::User,
            crate::message::Role::Assistant => ChatRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Produces one assistant reply for an ordered conversation.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError>;
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub timeout: Duration,
}

// Structures matching the /chat/completions and /embeddings endpoints
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize, Debug)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|source| ApiError::Transport { url: config.base_url.clone(), source })?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let url = self.endpoint(path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|source| ApiError::Transport { url: url.clone(), source })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, %url, "API request failed");
            return Err(ApiError::Status { status: status.as_u16(), body });
        }

        response.json::<R>().await.map_err(ApiError::Decode)
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    #[instrument(skip(self, messages), fields(model = %self.config.chat_model, turns = messages.len()))]
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError> {
        let request = CompletionRequest { model: &self.config.chat_model, messages };
        let response: CompletionResponse = self.post_json("chat/completions", &request).await?;

        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ApiError::Empty("completion choices"))?;

        debug!(chars = reply.len(), "Received completion");
        Ok(reply.trim().to_string())
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    #[instrument(skip(self, text), fields(model = %self.config.embedding_model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let request = EmbeddingRequest { model: &self.config.embedding_model, input: text };
        let response: EmbeddingResponse = self.post_json("embeddings", &request).await?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or(ApiError::Empty("embedding data"))?;

        debug!(dimensions = embedding.len(), "Received embedding");
        Ok(embedding)
    }
}
