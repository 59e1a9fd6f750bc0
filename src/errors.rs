use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// Everything that happens inside a running task is reported through the
/// event stream, never as a returned error; this enum covers the submit-time
/// and configuration surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A task is already running in this engine instance.
    #[error("a task is already running")]
    TaskBusy,

    /// The engine configuration is unusable (missing API key, bad model id).
    #[error("configuration error: {0}")]
    Config(String),

    /// The submitted task message is empty or otherwise malformed.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Persistence layer failure (key-value store, trace log).
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
