//! Sub-agent loops: the symbolic-recursion half of the engine.
//!
//! `llm_query` spawns one capped mini loop with a fresh REPL; `llm_batch`
//! runs several concurrently with allSettled semantics. Sub-agents never
//! throw into the parent REPL: every outcome is a string, error sentinels
//! included.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rlm_event_bus::InMemoryBus;

use crate::browser::BrowserDriver;
use crate::config::Limits;
use crate::context;
use crate::events::EngineEvent;
use crate::extract;
use crate::llm::{ChatMessage, ModelClient};
use crate::prompts;
use crate::repl::{meta, EngineCallbacks, ReplHandle};
use crate::tracker::{synthesize_summary, BlockResult};

const SUB_CALL_LIMIT_ERROR: &str = "[SUB-CALL ERROR] Maximum sub-call limit reached.";
const SUB_CALL_CANCELLED: &str = "[SUB-CALL CANCELLED]";
const MAX_CONSECUTIVE_LLM_FAILURES: u32 = 3;

/// Shared sub-call budget for one task.
pub struct SubCallLedger {
    cap: u32,
    used: AtomicU32,
}

impl SubCallLedger {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            used: AtomicU32::new(0),
        }
    }

    /// Claim one sub-call slot, returning its 0-based index.
    pub fn try_acquire(&self) -> Option<u32> {
        let index = self.used.fetch_add(1, Ordering::SeqCst);
        if index < self.cap {
            Some(index)
        } else {
            None
        }
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst).min(self.cap)
    }
}

/// Everything a sub-agent run needs from the parent task.
pub(crate) struct SubAgentShared {
    pub driver: Arc<dyn BrowserDriver>,
    pub client: Arc<dyn ModelClient>,
    pub bus: Arc<InMemoryBus<EngineEvent>>,
    pub limits: Limits,
    pub ledger: SubCallLedger,
    pub cancel: CancellationToken,
    pub parent_goal: String,
}

/// Callbacks for a sub-agent's REPL: logs pass through, recursion is refused.
struct SubCallbacks {
    bus: Arc<InMemoryBus<EngineEvent>>,
}

#[async_trait]
impl EngineCallbacks for SubCallbacks {
    async fn on_log(&mut self, message: String) {
        self.bus.emit(EngineEvent::Log { message });
    }

    async fn on_sub_query(&mut self, _prompt: String, _data: Option<Value>) -> String {
        // The sandbox already refuses recursion; this is the defensive twin.
        "[SUB-CALL ERROR] Sub-agents cannot spawn further sub-agents.".to_string()
    }

    async fn on_sub_batch(&mut self, _prompts: Vec<String>) -> Value {
        Value::String("[SUB-CALL ERROR] Sub-agents cannot spawn further sub-agents.".to_string())
    }
}

fn truncated(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

fn stringify_final(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Run one sub-agent. `Err` means the run was refused before it started
/// (budget or cancellation); `llm_batch` settles those as rejections, while
/// `llm_query` returns either variant into the REPL as a plain string.
pub(crate) async fn run_sub(
    shared: &SubAgentShared,
    prompt: String,
    data: Option<Value>,
    progress: &str,
) -> Result<String, String> {
    if shared.cancel.is_cancelled() {
        return Err(SUB_CALL_CANCELLED.to_string());
    }
    let Some(sub_call_index) = shared.ledger.try_acquire() else {
        return Ok(SUB_CALL_LIMIT_ERROR.to_string());
    };

    shared.bus.emit(EngineEvent::SubLlmStart {
        prompt: truncated(&prompt, 200),
        sub_call_index,
    });

    let pre_existing: BTreeSet<_> = shared
        .driver
        .list_tabs()
        .await
        .map(|tabs| tabs.into_iter().map(|tab| tab.id).collect())
        .unwrap_or_default();

    let result = run_sub_loop(shared, &prompt, data, progress).await;

    // Close tabs this sub-agent opened.
    if let Ok(tabs) = shared.driver.list_tabs().await {
        for tab in tabs {
            if !pre_existing.contains(&tab.id) {
                if let Err(err) = shared.driver.close_tab(&tab.id).await {
                    debug!(%err, tab = %tab.id, "failed to close sub-agent tab");
                }
            }
        }
    }

    shared.bus.emit(EngineEvent::SubLlmComplete {
        result_meta: truncated(&result, 200),
        sub_call_index,
    });

    Ok(result)
}

async fn run_sub_loop(
    shared: &SubAgentShared,
    prompt: &str,
    data: Option<Value>,
    progress: &str,
) -> String {
    let mut repl = ReplHandle::spawn(Arc::clone(&shared.driver), shared.limits.clone(), false);
    if let Some(data) = data {
        repl.set_global("__data", data).await;
    }

    let system = prompts::sub_system_prompt(&shared.parent_goal, progress);
    let mut conversation: Vec<ChatMessage> = vec![ChatMessage::user(prompt.to_string())];
    let mut callbacks = SubCallbacks {
        bus: Arc::clone(&shared.bus),
    };

    let max_iterations = shared.limits.max_sub_iterations;
    let mut consecutive_failures = 0u32;
    let mut consecutive_no_code = 0u32;
    let mut last_text = String::new();

    let mut iteration = 0u32;
    while iteration < max_iterations {
        iteration += 1;
        if shared.cancel.is_cancelled() {
            return SUB_CALL_CANCELLED.to_string();
        }

        let text = match shared
            .client
            .complete(&system, &conversation, &shared.cancel)
            .await
        {
            Ok(text) => {
                consecutive_failures = 0;
                text
            }
            Err(err) if err.is_cancelled() => return SUB_CALL_CANCELLED.to_string(),
            Err(err) => {
                consecutive_failures += 1;
                warn!(%err, consecutive_failures, "sub-agent model call failed");
                if consecutive_failures >= MAX_CONSECUTIVE_LLM_FAILURES {
                    return format!("[SUB-CALL ERROR] LLM failed 3 consecutive times: {err}");
                }
                // Feed the failure back and retry without consuming progress.
                append_to_last_user(
                    &mut conversation,
                    &format!("[transient model error: {err}; retrying]"),
                );
                iteration -= 1;
                continue;
            }
        };
        last_text = text.clone();

        let near_cap = iteration + 2 >= max_iterations;
        let blocks = extract::extract_blocks(&text);
        if blocks.is_empty() {
            consecutive_no_code += 1;
            if consecutive_no_code >= shared.limits.max_no_code_continuations {
                // Best effort: the prose itself is the sub-agent's answer.
                return last_text;
            }
            conversation.push(ChatMessage::assistant(text));
            conversation.push(ChatMessage::user(if near_cap {
                final_push_message(iteration, max_iterations)
            } else {
                context::no_code_continuation()
            }));
            continue;
        }
        consecutive_no_code = 0;
        conversation.push(ChatMessage::assistant(text));

        let mut results: Vec<BlockResult> = Vec::new();
        let mut final_value: Option<Value> = None;
        for code in &blocks {
            let outcome = repl.execute(code, &mut callbacks, &shared.cancel).await;
            let metadata = meta::result_metadata(&outcome, &shared.limits);
            results.push(BlockResult {
                code: code.clone(),
                metadata,
                error: outcome.error.clone(),
            });
            if outcome.final_called {
                final_value = Some(outcome.final_value.unwrap_or(Value::Null));
                break;
            }
            if shared.cancel.is_cancelled() {
                return SUB_CALL_CANCELLED.to_string();
            }
        }

        if let Some(final_value) = final_value {
            return stringify_final(&final_value);
        }

        let mut reply = results
            .iter()
            .enumerate()
            .map(|(index, block)| format!("Block {}: {}", index + 1, block.metadata))
            .collect::<Vec<_>>()
            .join("\n");
        if near_cap {
            reply.push_str(&format!(
                "\n\n{}",
                final_push_message(iteration, max_iterations)
            ));
        }
        debug!(iteration, summary = %synthesize_summary(&results), "sub-agent iteration done");
        conversation.push(ChatMessage::user(reply));
    }

    format!(
        "[SUB-CALL ERROR] Sub-agent reached {max_iterations} iterations without calling setFinal()"
    )
}

fn final_push_message(iteration: u32, max_iterations: u32) -> String {
    format!(
        "You are on iteration {iteration} of {max_iterations}. Call setFinal(value) \
         with your best answer immediately."
    )
}

fn append_to_last_user(conversation: &mut Vec<ChatMessage>, note: &str) {
    match conversation.last_mut() {
        Some(message) if matches!(message.role, crate::llm::ChatRole::User) => {
            message.content.push_str("\n\n");
            message.content.push_str(note);
        }
        _ => conversation.push(ChatMessage::user(note.to_string())),
    }
}

/// `llm_batch`: run sub-agents concurrently; one failure never cancels peers.
pub(crate) async fn run_batch(
    shared: &SubAgentShared,
    prompts: Vec<String>,
    progress: &str,
) -> Value {
    let runs = prompts
        .into_iter()
        .map(|prompt| run_sub(shared, prompt, None, progress));
    let settled = join_all(runs).await;
    Value::Array(
        settled
            .into_iter()
            .map(|outcome| match outcome {
                Ok(value) => json!({ "status": "fulfilled", "value": value }),
                Err(error) => json!({ "status": "rejected", "error": error }),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_caps_acquisitions() {
        let ledger = SubCallLedger::new(2);
        assert_eq!(ledger.try_acquire(), Some(0));
        assert_eq!(ledger.try_acquire(), Some(1));
        assert_eq!(ledger.try_acquire(), None);
        assert_eq!(ledger.used(), 2);
    }

    #[test]
    fn zero_cap_refuses_immediately() {
        let ledger = SubCallLedger::new(0);
        assert_eq!(ledger.try_acquire(), None);
    }

    #[test]
    fn final_push_demands_set_final() {
        assert!(final_push_message(8, 10).contains("setFinal"));
        assert!(final_push_message(9, 10).contains("immediately"));
    }

    #[test]
    fn final_values_stringify_plainly() {
        assert_eq!(stringify_final(&Value::String("done".into())), "done");
        assert_eq!(stringify_final(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(stringify_final(&json!(42)), "42");
    }
}
