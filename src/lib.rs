//! Bounded-iteration recursive language model (RLM) execution engine.
//!
//! The engine drives a language model against a user task by letting it write
//! JavaScript that runs in a sandboxed REPL whose external variables are live
//! browser tabs. REPL state persists across iterations, the model only ever
//! sees metadata summaries of prior results, and the model may delegate to
//! capped sub-agents with independent REPLs. Every step is published on a
//! typed event bus for an observer UI.

pub mod browser;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod events;
pub mod extract;
pub mod llm;
pub mod prompts;
pub mod repl;
pub mod store;
pub mod tab_diff;
pub mod trace;
pub mod tracker;

pub use browser::{BrowserDriver, MockBrowserDriver};
pub use config::{EngineConfig, Limits, Provider};
pub use engine::Engine;
pub use errors::EngineError;
pub use events::{EngineEvent, TaskState, TaskStatus};
pub use llm::{build_model_client, ChatMessage, ChatRole, ModelClient, ScriptedClient};
