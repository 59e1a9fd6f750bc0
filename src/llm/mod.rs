//! Model client facade: streaming/non-streaming completion over two
//! provider wire formats, with cancellation threaded through.

mod anthropic;
mod openai;
mod scripted;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub use scripted::{ScriptedClient, ScriptedTurn};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, Provider};
use crate::errors::EngineError;

/// Sampling temperature fixed by the engine.
pub const TEMPERATURE: f32 = 0.0;
/// Output token ceiling fixed by the engine.
pub const MAX_OUTPUT_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of the alternating conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Failures from the model transport.
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    #[error("request cancelled")]
    Cancelled,

    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model response invalid: {0}")]
    Protocol(String),
}

impl ModelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModelError::Cancelled)
    }
}

/// Narrow interface over a chat-completion provider.
///
/// `stream` pushes tokens into the provided channel as they arrive and
/// returns the concatenated text; `complete` is the single-shot variant.
/// Both observe the cancellation token at every suspension point.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tokens: mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError>;

    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String, ModelError>;
}

/// Instantiate the client facade selected by the configuration.
pub fn build_model_client(
    config: &EngineConfig,
    model: &str,
) -> Result<Arc<dyn ModelClient>, EngineError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| EngineError::config("no API key configured"))?;
    if model.trim().is_empty() {
        return Err(EngineError::config("model name is empty"));
    }
    let client: Arc<dyn ModelClient> = match config.provider {
        Provider::Anthropic => Arc::new(
            AnthropicClient::new(api_key, model.to_string(), config.base_url.clone())
                .map_err(|err| EngineError::config(err.to_string()))?,
        ),
        Provider::OpenaiCompatible => Arc::new(
            OpenAiClient::new(api_key, model.to_string(), config.base_url.clone())
                .map_err(|err| EngineError::config(err.to_string()))?,
        ),
    };
    Ok(client)
}

/// Split one SSE event out of the accumulation buffer, `data:` payload only.
pub(crate) fn next_sse_data(buffer: &mut String) -> Option<String> {
    let pos = buffer.find("\n\n")?;
    let event: String = buffer.drain(..pos + 2).collect();
    let data = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect::<Vec<_>>()
        .join("\n");
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_splits_on_blank_line() {
        let mut buffer = String::from("event: x\ndata: {\"a\":1}\n\ndata: tail");
        assert_eq!(next_sse_data(&mut buffer).as_deref(), Some("{\"a\":1}"));
        assert_eq!(buffer, "data: tail");
        assert!(next_sse_data(&mut buffer).is_none());
    }

    #[test]
    fn sse_event_without_data_yields_empty_payload() {
        let mut buffer = String::from(": keepalive\n\n");
        assert_eq!(next_sse_data(&mut buffer).as_deref(), Some(""));
    }
}
