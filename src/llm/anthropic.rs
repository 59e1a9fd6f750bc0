//! Anthropic messages-API adapter.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    next_sse_data, ChatMessage, ChatRole, ModelClient, ModelError, MAX_OUTPUT_TOKENS, TEMPERATURE,
};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl AnthropicClient {
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

    fn request_body(&self, system: &str, messages: &[ChatMessage], stream: bool) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            temperature: TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
            system: system.to_string(),
            stream,
            messages: messages
                .iter()
                .map(|message| WireMessage {
                    role: match message.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    }
                    .to_string(),
                    content: message.content.clone(),
                })
                .collect(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.api_base.trim_end_matches('/'))
    }

    async fn send(
        &self,
        body: &MessagesRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ModelError> {
        let request = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            sent = request.send() => {
                sent.map_err(|err| ModelError::Transport(format!("anthropic request failed: {err}")))?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(ModelError::Transport(format!(
                "anthropic returned {status}: {text}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
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
                let event: Value = match serde_json::from_str(&data) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%err, "skipping unparseable SSE payload");
                        continue;
                    }
                };
                match event["type"].as_str() {
                    Some("content_block_delta") => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            full_text.push_str(text);
                            let _ = tokens.send(text.to_string());
                        }
                    }
                    Some("error") => {
                        return Err(ModelError::Protocol(format!(
                            "anthropic stream error: {}",
                            event["error"]["message"].as_str().unwrap_or("unknown")
                        )));
                    }
                    Some("message_stop") => return Ok(full_text),
                    _ => {}
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

        let parsed: MessagesResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            parsed = response.json() => {
                parsed.map_err(|err| ModelError::Protocol(format!("anthropic response invalid: {err}")))?
            }
        };

        let content = parsed
            .content
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            return Err(ModelError::Protocol(
                "anthropic response missing content".to_string(),
            ));
        }
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    system: String,
    stream: bool,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    text: Option<String>,
}
