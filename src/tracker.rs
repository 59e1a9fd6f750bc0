//! Task tracker: accumulates iteration records and derives the mechanical
//! progress summaries used for prompt reinforcement and history compaction.

use chrono::{DateTime, Utc};
use std::time::Duration;

use rlm_core_types::PageChange;

/// A single executed code block inside one iteration.
#[derive(Debug, Clone)]
pub struct BlockResult {
    /// Verbatim code as extracted from the model response.
    pub code: String,
    /// Structural result summary. Never raw output.
    pub metadata: String,
    pub error: Option<String>,
}

/// One model→execute cycle.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// 1-based.
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub blocks: Vec<BlockResult>,
    /// One-line intent summary used in reinforcement and compacted history.
    pub summary: String,
    /// Full metadata string carried into the action history.
    pub full_metadata: String,
    /// Tab changes observed immediately before this iteration.
    pub page_changes: Vec<PageChange>,
}

/// Records the task's iteration history.
#[derive(Debug)]
pub struct TaskTracker {
    goal: String,
    max_iterations: u32,
    records: Vec<IterationRecord>,
}

impl TaskTracker {
    pub fn new(goal: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            goal: goal.into(),
            max_iterations,
            records: Vec::new(),
        }
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Header block re-anchoring the model on the task each iteration.
    ///
    /// Progress lines come from the mechanical one-liners, never from model
    /// `log()` output.
    pub fn reinforcement_block(&self, iteration: u32) -> String {
        let mut block = format!(
            "## Task\n{}\n\nIteration {} of {}.",
            self.goal, iteration, self.max_iterations
        );
        if !self.records.is_empty() {
            block.push_str("\n\nProgress so far:");
            for record in &self.records {
                block.push_str(&format!("\n- Iter {}: {}", record.index, record.summary));
            }
        }
        block
    }

    /// Short progress digest handed to sub-agents: the last three one-liners.
    pub fn progress_summary(&self) -> String {
        let tail = self.records.iter().rev().take(3).collect::<Vec<_>>();
        tail.iter()
            .rev()
            .map(|record| format!("Iter {}: {}", record.index, record.summary))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Compose the iteration's history metadata from its block results.
///
/// Blocks are prefixed `Block N:` only when the iteration ran more than one.
pub fn compose_full_metadata(blocks: &[BlockResult]) -> String {
    match blocks {
        [] => "No code executed.".to_string(),
        [only] => only.metadata.clone(),
        many => many
            .iter()
            .enumerate()
            .map(|(index, block)| format!("Block {}: {}", index + 1, block.metadata))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Derive the one-line intent summary from what the code actually did.
pub fn synthesize_summary(blocks: &[BlockResult]) -> String {
    if blocks.is_empty() {
        return "No code produced; prompted to continue.".to_string();
    }
    let code: String = blocks
        .iter()
        .map(|block| block.code.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut actions: Vec<&str> = Vec::new();
    let mut note = |present: bool, label: &'static str, actions: &mut Vec<&str>| {
        if present && !actions.contains(&label) {
            actions.push(label);
        }
    };

    note(code.contains("llm_batch"), "ran parallel sub-agents", &mut actions);
    note(
        code.contains("llm_query") && !code.contains("llm_batch"),
        "delegated a sub-task",
        &mut actions,
    );
    note(code.contains("openTab"), "opened a tab", &mut actions);
    note(code.contains("navigate"), "navigated", &mut actions);
    note(
        code.contains("click(") || code.contains("type(") || code.contains("scroll("),
        "interacted with the page",
        &mut actions,
    );
    note(
        code.contains("execInTab")
            || code.contains("getText")
            || code.contains("getDOM")
            || code.contains("getLinks")
            || code.contains("getInputs")
            || code.contains("querySelector")
            || code.contains("getSearchResults")
            || code.contains("getWikiTables")
            || code.contains("parsePage")
            || code.contains("parseHTML"),
        "inspected page content",
        &mut actions,
    );
    note(code.contains("env."), "stored data in env", &mut actions);
    note(code.contains("setFinal"), "finalized the answer", &mut actions);

    let mut summary = if actions.is_empty() {
        "Executed code".to_string()
    } else {
        let listed = actions[..actions.len().min(3)].join(", ");
        let mut chars = listed.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => listed,
        }
    };

    if blocks.iter().any(|block| block.error.is_some()) {
        summary.push_str(" (error)");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(code: &str, error: Option<&str>) -> BlockResult {
        BlockResult {
            code: code.to_string(),
            metadata: "Result: void".to_string(),
            error: error.map(str::to_string),
        }
    }

    fn record(index: u32, summary: &str) -> IterationRecord {
        IterationRecord {
            index,
            started_at: Utc::now(),
            duration: Duration::from_millis(10),
            blocks: vec![],
            summary: summary.to_string(),
            full_metadata: format!("metadata {index}"),
            page_changes: vec![],
        }
    }

    #[test]
    fn summary_reflects_keywords_and_errors() {
        let summary = synthesize_summary(&[block("const t = await openTab('x'); env.t = t;", None)]);
        assert!(summary.to_lowercase().contains("opened a tab"));
        assert!(summary.contains("stored data in env"));

        let summary = synthesize_summary(&[block("click(tab, '#go')", Some("boom"))]);
        assert!(summary.ends_with("(error)"));

        assert_eq!(
            synthesize_summary(&[]),
            "No code produced; prompted to continue."
        );
    }

    #[test]
    fn block_prefixes_only_for_multiple_blocks() {
        let single = compose_full_metadata(&[block("a()", None)]);
        assert!(!single.contains("Block 1:"));

        let double = compose_full_metadata(&[block("a()", None), block("b()", None)]);
        assert!(double.contains("Block 1:"));
        assert!(double.contains("Block 2:"));
    }

    #[test]
    fn reinforcement_lists_progress() {
        let mut tracker = TaskTracker::new("find a fact", 25);
        tracker.push(record(1, "Opened a tab"));
        tracker.push(record(2, "Inspected page content"));
        let reinforcement = tracker.reinforcement_block(3);
        assert!(reinforcement.contains("find a fact"));
        assert!(reinforcement.contains("Iteration 3 of 25."));
        assert!(reinforcement.contains("- Iter 1: Opened a tab"));
    }

    #[test]
    fn progress_summary_keeps_last_three() {
        let mut tracker = TaskTracker::new("goal", 25);
        for index in 1..=5 {
            tracker.push(record(index, &format!("step {index}")));
        }
        let summary = tracker.progress_summary();
        assert!(!summary.contains("step 2"));
        assert!(summary.contains("step 3"));
        assert!(summary.contains("step 5"));
    }
}
