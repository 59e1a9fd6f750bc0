//! The main-agent iteration loop.
//!
//! Task state machine: `Idle → Running → {Complete | Cancelled | Error}`.
//! Inside `Running`, each iteration walks build-context → stream → extract →
//! execute → record, with cancellation checked at every major suspension
//! point. Exactly one `complete` event terminates the stream.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rlm_event_bus::InMemoryBus;

use crate::browser::BrowserDriver;
use crate::config::EngineConfig;
use crate::context::{self, EnvReport};
use crate::events::{EngineEvent, TaskState, TaskStatus};
use crate::extract;
use crate::llm::{ChatMessage, ModelClient};
use crate::prompts;
use crate::repl::{meta, EngineCallbacks, ReplHandle};
use crate::tab_diff::TabSnapshot;
use crate::tracker::{compose_full_metadata, synthesize_summary, BlockResult, IterationRecord, TaskTracker};

use super::subagent::{self, SubAgentShared, SubCallLedger};

/// How a task run ended, before it is reported as events.
enum RunOutcome {
    Final(Value),
    IterationCapReached,
    Cancelled,
    Error(String),
}

/// Callbacks wired into the main REPL.
struct MainCallbacks {
    bus: Arc<InMemoryBus<EngineEvent>>,
    shared: Arc<SubAgentShared>,
    /// Parent progress digest, refreshed each iteration.
    progress: String,
}

#[async_trait]
impl EngineCallbacks for MainCallbacks {
    async fn on_log(&mut self, message: String) {
        self.bus.emit(EngineEvent::Log { message });
    }

    async fn on_sub_query(&mut self, prompt: String, data: Option<Value>) -> String {
        match subagent::run_sub(&self.shared, prompt, data, &self.progress).await {
            Ok(result) | Err(result) => result,
        }
    }

    async fn on_sub_batch(&mut self, prompts: Vec<String>) -> Value {
        subagent::run_batch(&self.shared, prompts, &self.progress).await
    }
}

pub(crate) struct TaskController {
    pub config: EngineConfig,
    pub driver: Arc<dyn BrowserDriver>,
    pub client: Arc<dyn ModelClient>,
    pub sub_client: Arc<dyn ModelClient>,
    pub bus: Arc<InMemoryBus<EngineEvent>>,
    pub cancel: CancellationToken,
    pub state: Arc<Mutex<TaskState>>,
}

impl TaskController {
    /// Drive the task to completion. Consumes the controller; emits exactly
    /// one `complete` event.
    pub async fn run(self, goal: String) {
        info!(goal = %truncate_for_log(&goal), "task started");
        let outcome = self.run_loop(&goal).await;

        let (status, final_value) = match outcome {
            RunOutcome::Final(value) => (TaskStatus::Complete, Some(value)),
            RunOutcome::IterationCapReached => (
                TaskStatus::Complete,
                Some(Value::String(format!(
                    "Reached maximum iterations ({}). Partial results may be available.",
                    self.config.max_iterations
                ))),
            ),
            RunOutcome::Cancelled => (
                TaskStatus::Cancelled,
                Some(Value::String("Task cancelled by user.".to_string())),
            ),
            RunOutcome::Error(message) => {
                self.bus.emit(EngineEvent::Error { error: message });
                (TaskStatus::Error, None)
            }
        };

        {
            let mut state = self.state.lock();
            state.status = status;
            state.final_value = final_value.clone();
        }
        info!(?status, "task finished");
        self.bus.emit(EngineEvent::Complete {
            final_value,
        });
    }

    async fn run_loop(&self, goal: &str) -> RunOutcome {
        let system = prompts::main_system_prompt();
        let mut tracker = TaskTracker::new(goal, self.config.max_iterations);
        let mut repl = ReplHandle::spawn(
            Arc::clone(&self.driver),
            self.config.limits.clone(),
            true,
        );
        let mut callbacks = MainCallbacks {
            bus: Arc::clone(&self.bus),
            shared: Arc::new(SubAgentShared {
                driver: Arc::clone(&self.driver),
                client: Arc::clone(&self.sub_client),
                bus: Arc::clone(&self.bus),
                limits: self.config.limits.clone(),
                ledger: SubCallLedger::new(self.config.max_sub_calls),
                cancel: self.cancel.clone(),
                parent_goal: goal.to_string(),
            }),
            progress: String::new(),
        };

        let mut conversation: Vec<ChatMessage> = Vec::new();
        let mut last_snapshot = self.snapshot().await;
        let mut consecutive_no_code = 0u32;
        let mut pending_continuation: Option<String> = None;

        for iteration in 1..=self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            let started = Instant::now();
            let started_at = chrono::Utc::now();
            self.state.lock().iteration = iteration;
            self.bus.emit(EngineEvent::IterationStart {
                iteration,
                task_goal: goal.to_string(),
            });

            // Page changes since the previous iteration's snapshot.
            let current_snapshot = self.snapshot().await;
            let page_changes = last_snapshot.diff(&current_snapshot);
            if !page_changes.is_empty() {
                self.bus.emit(EngineEvent::PageChanges {
                    changes: page_changes.clone(),
                });
            }

            // Environment metadata for the prompt (and the observer).
            let descriptors = repl.env_metadata().await;
            if !descriptors.is_empty() {
                self.bus.emit(EngineEvent::EnvUpdate {
                    metadata: meta::descriptors_json(&descriptors),
                });
            }
            let env_report = EnvReport {
                tab_count: current_snapshot.tab_ids().len(),
                active_tab: self.driver.active_tab_id().await.ok().flatten(),
                variables_text: meta::render_descriptors(&descriptors),
            };

            let mut user_message = context::build_user_message(
                iteration,
                &tracker,
                &page_changes,
                &env_report,
                &self.config.limits,
            );
            if let Some(continuation) = pending_continuation.take() {
                user_message = format!("{continuation}\n\n{user_message}");
            }

            let mut messages = conversation.clone();
            messages.push(ChatMessage::user(user_message.clone()));

            // Stream the model response, forwarding tokens in order.
            let (token_tx, mut token_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            let forward_bus = Arc::clone(&self.bus);
            let forwarder = tokio::spawn(async move {
                while let Some(token) = token_rx.recv().await {
                    forward_bus.emit(EngineEvent::StreamToken { token, iteration });
                }
            });
            let streamed = self
                .client
                .stream(&system, &messages, token_tx, &self.cancel)
                .await;
            let _ = forwarder.await;

            let response_text = match streamed {
                Ok(text) => text,
                Err(err) if err.is_cancelled() || self.cancel.is_cancelled() => {
                    return RunOutcome::Cancelled;
                }
                Err(err) => return RunOutcome::Error(err.to_string()),
            };
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            let blocks = extract::extract_blocks(&response_text);
            debug!(iteration, blocks = blocks.len(), "model response parsed");

            if blocks.is_empty() {
                consecutive_no_code += 1;
                if consecutive_no_code >= self.config.limits.max_no_code_continuations {
                    return RunOutcome::Error(format!(
                        "model produced no executable code {consecutive_no_code} times in a row"
                    ));
                }
                conversation.push(ChatMessage::user(user_message));
                conversation.push(ChatMessage::assistant(response_text));
                pending_continuation = Some(context::no_code_continuation());

                tracker.push(IterationRecord {
                    index: iteration,
                    started_at,
                    duration: started.elapsed(),
                    blocks: Vec::new(),
                    summary: synthesize_summary(&[]),
                    full_metadata: compose_full_metadata(&[]),
                    page_changes,
                });
                last_snapshot = self.snapshot().await;
                continue;
            }
            consecutive_no_code = 0;

            callbacks.progress = tracker.progress_summary();

            let mut block_results: Vec<BlockResult> = Vec::new();
            let mut final_value: Option<Value> = None;
            for (block_index, code) in blocks.iter().enumerate() {
                self.bus.emit(EngineEvent::CodeGenerated {
                    code: code.clone(),
                    block_index,
                });
                let outcome = repl.execute(code, &mut callbacks, &self.cancel).await;
                let metadata = meta::result_metadata(&outcome, &self.config.limits);
                self.bus.emit(EngineEvent::CodeResult {
                    metadata: metadata.clone(),
                    block_index,
                    error: outcome.error.clone(),
                });
                block_results.push(BlockResult {
                    code: code.clone(),
                    metadata,
                    error: outcome.error,
                });
                if outcome.final_called {
                    final_value = Some(outcome.final_value.unwrap_or(Value::Null));
                    break;
                }
                if self.cancel.is_cancelled() {
                    break;
                }
            }

            tracker.push(IterationRecord {
                index: iteration,
                started_at,
                duration: started.elapsed(),
                summary: synthesize_summary(&block_results),
                full_metadata: compose_full_metadata(&block_results),
                blocks: block_results,
                page_changes,
            });

            last_snapshot = self.snapshot().await;
            conversation.push(ChatMessage::user(user_message));
            conversation.push(ChatMessage::assistant(response_text));

            if let Some(value) = final_value {
                return RunOutcome::Final(value);
            }
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }
        }

        warn!(
            max_iterations = self.config.max_iterations,
            "iteration cap reached without setFinal"
        );
        RunOutcome::IterationCapReached
    }

    async fn snapshot(&self) -> TabSnapshot {
        match self.driver.list_tabs().await {
            Ok(tabs) => TabSnapshot::capture(&tabs),
            Err(err) => {
                warn!(%err, "tab snapshot failed");
                TabSnapshot::default()
            }
        }
    }
}

fn truncate_for_log(text: &str) -> String {
    if text.chars().count() <= 120 {
        text.to_string()
    } else {
        text.chars().take(120).collect::<String>() + "…"
    }
}
