//! Client for OpenAI-compatible chat completion endpoints.

use crate::config::ModelConfig;
use crate::errors::ModelError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A thin chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    base_url: String,
    api_key: Option<String>,
    model_id: String,
    timeout_seconds: f64,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl ChatClient {
    /// Builds a client from the model configuration.
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ModelError::NotConfigured)?;
        let timeout = config
            .timeout()
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_id: config.model_id.clone(),
            timeout_seconds: config.timeout_seconds,
            client,
        })
    }

    /// The configured model id.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Sends one system + user exchange and returns the reply text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(self.timeout_seconds)
            } else {
                ModelError::Connection(format!("{}: {e}", self.base_url))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Response(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::Response("no choices".to_string()))?;
        debug!(model = %self.model_id, chars = content.len(), "Model replied");
        Ok(content)
    }
}
