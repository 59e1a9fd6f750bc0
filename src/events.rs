//! Typed events published on the engine's observer bus.
//!
//! Ordering contract: events for iteration *k* precede every event for
//! iteration *k+1*; within an iteration, `code-generated[i]` precedes
//! `code-result[i]` precedes any block *i+1* event; `complete` is terminal
//! and emitted exactly once per task.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rlm_core_types::PageChange;

/// One event on the observer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    IterationStart {
        iteration: u32,
        #[serde(rename = "taskGoal")]
        task_goal: String,
    },
    StreamToken {
        token: String,
        iteration: u32,
    },
    CodeGenerated {
        code: String,
        #[serde(rename = "blockIndex")]
        block_index: usize,
    },
    CodeResult {
        metadata: String,
        #[serde(rename = "blockIndex")]
        block_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SubLlmStart {
        /// Truncated to 200 characters.
        prompt: String,
        #[serde(rename = "subCallIndex")]
        sub_call_index: u32,
    },
    SubLlmComplete {
        #[serde(rename = "resultMeta")]
        result_meta: String,
        #[serde(rename = "subCallIndex")]
        sub_call_index: u32,
    },
    PageChanges {
        changes: Vec<PageChange>,
    },
    EnvUpdate {
        /// JSON-encoded variable descriptor list.
        metadata: String,
    },
    Log {
        message: String,
    },
    Error {
        error: String,
    },
    Complete {
        #[serde(rename = "final")]
        final_value: Option<Value>,
    },
}

impl EngineEvent {
    /// Stream tokens are high-frequency and excluded from trace persistence.
    pub fn is_stream_token(&self) -> bool {
        matches!(self, EngineEvent::StreamToken { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, EngineEvent::Complete { .. })
    }
}

/// Lifecycle status of the engine's single task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Idle
    }
}

/// Snapshot of engine state returned by `get_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Original user message of the current or last task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// 1-based index of the iteration in flight (or last finished).
    pub iteration: u32,
    /// Final value once the task completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let event = EngineEvent::IterationStart {
            iteration: 1,
            task_goal: "find the answer".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "iteration-start");
        assert_eq!(json["taskGoal"], "find the answer");

        let event = EngineEvent::CodeResult {
            metadata: "Result: void".into(),
            block_index: 0,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "code-result");
        assert_eq!(json["blockIndex"], 0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn complete_carries_null_final() {
        let event = EngineEvent::Complete { final_value: None };
        assert!(event.is_complete());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["final"], Value::Null);
    }
}
