//! Assembles the user-turn content for each iteration.
//!
//! Section order is fixed; a section is present iff non-empty: task
//! reinforcement, page changes, environment metadata, compacted action
//! history, and (from iteration 2) a standing reminder to call `setFinal`.

pub mod compactor;

use rlm_core_types::{PageChange, TabId};

use crate::config::Limits;
use crate::tracker::TaskTracker;

/// Environment facts injected into the prompt.
///
/// Deliberately thin: the tab list itself is an external variable the model
/// queries through the `tabs` getter, so only the count and active id appear
/// here, followed by the REPL variable descriptors.
#[derive(Debug, Clone, Default)]
pub struct EnvReport {
    pub tab_count: usize,
    pub active_tab: Option<TabId>,
    /// Human-readable variable descriptor lines from the REPL.
    pub variables_text: String,
}

/// Build the single user message for the next iteration.
pub fn build_user_message(
    iteration: u32,
    tracker: &TaskTracker,
    page_changes: &[PageChange],
    env: &EnvReport,
    limits: &Limits,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(tracker.reinforcement_block(iteration));

    if !page_changes.is_empty() {
        let mut section = String::from("## Page Changes");
        for change in page_changes {
            section.push_str(&format!(
                "\n- tab {} {}: {:?} -> {:?}",
                change.tab_id, change.field, change.old, change.new
            ));
        }
        sections.push(section);
    }

    let mut env_section = format!(
        "## Environment\nTabs open: {}{}",
        env.tab_count,
        env.active_tab
            .as_ref()
            .map(|id| format!(" (active: {id})"))
            .unwrap_or_default()
    );
    if !env.variables_text.is_empty() {
        env_section.push_str("\n\nVariables:\n");
        env_section.push_str(&env.variables_text);
    }
    sections.push(env_section);

    let history = compactor::compact_history(tracker.records(), limits);
    if !history.is_empty() {
        sections.push(format!("## Action History\n{history}"));
    }

    if iteration >= 2 {
        sections.push(
            "Reminder: as soon as you know the answer, call setFinal(value) instead of exploring further."
                .to_string(),
        );
    }

    sections.join("\n\n")
}

/// Continuation prompt appended when a response contained no code.
pub fn no_code_continuation() -> String {
    "Your last response contained no executable code. Reply with a ```repl code block \
     that makes progress on the task, or call setFinal(value) if you already know the answer."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core_types::{TabField, TabId};

    fn env() -> EnvReport {
        EnvReport {
            tab_count: 2,
            active_tab: Some(TabId("tab-1".into())),
            variables_text: "env.answer: number (42)".into(),
        }
    }

    #[test]
    fn first_iteration_has_no_reminder_or_history() {
        let tracker = TaskTracker::new("do the thing", 25);
        let message = build_user_message(1, &tracker, &[], &env(), &Limits::default());
        assert!(message.contains("## Task"));
        assert!(message.contains("Iteration 1 of 25."));
        assert!(!message.contains("Reminder:"));
        assert!(!message.contains("## Action History"));
        assert!(!message.contains("## Page Changes"));
    }

    #[test]
    fn later_iterations_carry_reminder() {
        let tracker = TaskTracker::new("goal", 25);
        let message = build_user_message(2, &tracker, &[], &env(), &Limits::default());
        assert!(message.contains("Reminder:"));
    }

    #[test]
    fn page_changes_render_when_present() {
        let tracker = TaskTracker::new("goal", 25);
        let changes = vec![PageChange {
            tab_id: TabId("t".into()),
            field: TabField::Url,
            old: "a".into(),
            new: "b".into(),
        }];
        let message = build_user_message(1, &tracker, &changes, &env(), &Limits::default());
        assert!(message.contains("## Page Changes"));
        assert!(message.contains("\"a\" -> \"b\""));
    }

    #[test]
    fn environment_lists_tab_count_not_tab_list() {
        let tracker = TaskTracker::new("goal", 25);
        let message = build_user_message(1, &tracker, &[], &env(), &Limits::default());
        assert!(message.contains("Tabs open: 2 (active: tab-1)"));
        assert!(message.contains("env.answer: number (42)"));
    }
}
