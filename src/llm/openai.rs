//! OpenAI-compatible chat-completions adapter.
//!
//! Works against any endpoint speaking the `/chat/completions` wire format,
//! which is what most self-hosted gateways expose.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    next_sse_data, ChatMessage, ChatRole, ModelClient, ModelError, MAX_OUTPUT_TOKENS, TEMPERATURE,
};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
    ) -> Result<Self, ModelError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ModelError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            api_key,
            model,
            api_base: base_url.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    fn request_body(&self, system: &str, messages: &[ChatMessage], stream: bool) -> ChatRequest {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: "system".to_string(),
            content: system.to_string(),
        });
        wire.extend(messages.iter().map(|message| WireMessage {
            role: match message.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            }
            .to_string(),
            content: message.content.clone(),
        }));
        ChatRequest {
            model: self.model.clone(),
            temperature: TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
            stream,
            messages: wire,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    async fn send(
        &self,
        body: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ModelError> {
        let request = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            sent = request.send() => {
                sent.map_err(|err| ModelError::Transport(format!("chat request failed: {err}")))?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(ModelError::Transport(format!(
                "chat endpoint returned {status}: {text}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn stream(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tokens: mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        let body = self.request_body(system, messages, true);
        let response = self.send(&body, cancel).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_text = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk =
                chunk.map_err(|err| ModelError::Transport(format!("stream error: {err}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(data) = next_sse_data(&mut buffer) {
                if data.is_empty() {
                    continue;
                }
                if data.trim() == "[DONE]" {
                    return Ok(full_text);
                }
                let delta: StreamChunk = match serde_json::from_str(&data) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%err, "skipping unparseable SSE payload");
                        continue;
                    }
                };
                if let Some(text) = delta
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.as_deref())
                {
                    full_text.push_str(text);
                    let _ = tokens.send(text.to_string());
                }
            }
        }

        Ok(full_text)
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        let body = self.request_body(system, messages, false);
        let response = self.send(&body, cancel).await?;

        let parsed: ChatResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            parsed = response.json() => {
                parsed.map_err(|err| ModelError::Protocol(format!("chat response invalid: {err}")))?
            }
        };

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ModelError::Protocol("chat response missing content".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
