//! Deterministic model client for tests and offline development.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ChatMessage, ModelClient, ModelError};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Return this text (streamed in small chunks).
    Text(String),
    /// Fail the request with a transport error.
    Error(String),
}

/// Plays back a fixed sequence of responses.
///
/// Deterministic stand-in for a real provider: scenario tests script the
/// model's side of the conversation and assert on the resulting event stream.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: Mutex<u32>,
    /// Delay between streamed chunks, letting tests cancel mid-stream.
    token_delay: Duration,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: Mutex::new(0),
            token_delay: Duration::ZERO,
        }
    }

    /// Convenience constructor from plain response texts.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|text| ScriptedTurn::Text(text.into()))
                .collect(),
        )
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Number of model calls made so far (streaming and single-shot).
    pub fn call_count(&self) -> u32 {
        *self.calls.lock()
    }

    fn next_turn(&self) -> Result<String, ModelError> {
        *self.calls.lock() += 1;
        match self.turns.lock().pop_front() {
            Some(ScriptedTurn::Text(text)) => Ok(text),
            Some(ScriptedTurn::Error(message)) => Err(ModelError::Transport(message)),
            None => Err(ModelError::Transport("script exhausted".to_string())),
        }
    }

    fn chunk(text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(12)
            .map(|chunk| chunk.iter().collect())
            .collect()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(
        &self,
        _system: &str,
        _messages: &[ChatMessage],
        tokens: mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        let text = self.next_turn()?;
        for chunk in Self::chunk(&text) {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            let _ = tokens.send(chunk);
            if !self.token_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    _ = tokio::time::sleep(self.token_delay) => {}
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        Ok(text)
    }

    async fn complete(
        &self,
        _system: &str,
        _messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        self.next_turn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_chunks_that_reassemble() {
        let client = ScriptedClient::from_texts(["hello scripted world"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let full = client.stream("", &[], tx, &cancel).await.unwrap();
        assert_eq!(full, "hello scripted world");

        let mut reassembled = String::new();
        while let Ok(chunk) = rx.try_recv() {
            reassembled.push_str(&chunk);
        }
        assert_eq!(reassembled, full);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn scripted_error_surfaces_as_transport() {
        let client = ScriptedClient::new(vec![ScriptedTurn::Error("overloaded".into())]);
        let cancel = CancellationToken::new();
        let err = client.complete("", &[], &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::Transport(_)));
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let client = ScriptedClient::from_texts(Vec::<String>::new());
        let cancel = CancellationToken::new();
        assert!(client.complete("", &[], &cancel).await.is_err());
    }
}
