//! Token-budgeted adaptive compaction of iteration history.
//!
//! A fixed keep-last-N policy breaks as soon as one iteration produces a
//! large metadata record; sizing by estimated tokens adapts instead.

use crate::config::Limits;
use crate::tracker::IterationRecord;

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn render_record(record: &IterationRecord) -> String {
    format!("Iteration {}:\n{}", record.index, record.full_metadata)
}

fn condense_record(record: &IterationRecord) -> String {
    format!("Iter {}: {}", record.index, record.summary)
}

/// Produce the action-history text for the next prompt.
pub fn compact_history(records: &[IterationRecord], limits: &Limits) -> String {
    if records.is_empty() {
        return String::new();
    }

    let full = records
        .iter()
        .map(render_record)
        .collect::<Vec<_>>()
        .join("\n\n");

    let budget = limits.history_token_budget;
    let threshold = budget * limits.history_compact_percent / 100;
    if estimate_tokens(&full) <= threshold {
        return full;
    }

    let keep = records.len().min(3);
    let (older, recent) = records.split_at(records.len() - keep);
    let tail = recent
        .iter()
        .map(render_record)
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut condensed: Vec<String> = older.iter().map(condense_record).collect();

    // Drop oldest condensed lines until the whole thing fits the budget.
    loop {
        let text = if condensed.is_empty() {
            tail.clone()
        } else {
            format!("{}\n\n{}", condensed.join("\n"), tail)
        };
        if estimate_tokens(&text) <= budget {
            return text;
        }
        if condensed.is_empty() {
            // The recent tail alone is over budget; cut from its front so the
            // newest metadata survives.
            let max_chars = budget.saturating_mul(4);
            let chars: Vec<char> = text.chars().collect();
            let start = chars.len().saturating_sub(max_chars);
            return chars[start..].iter().collect();
        }
        condensed.remove(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::IterationRecord;
    use chrono::Utc;
    use std::time::Duration;

    fn record(index: u32, metadata: String) -> IterationRecord {
        IterationRecord {
            index,
            started_at: Utc::now(),
            duration: Duration::from_millis(1),
            blocks: vec![],
            summary: format!("summary {index}"),
            full_metadata: metadata,
            page_changes: vec![],
        }
    }

    #[test]
    fn under_threshold_returns_everything() {
        let limits = Limits::default();
        let records = vec![record(1, "small".into()), record(2, "tiny".into())];
        let text = compact_history(&records, &limits);
        assert!(text.contains("Iteration 1:"));
        assert!(text.contains("Iteration 2:"));
        assert!(!text.contains("Iter 1: summary"));
    }

    #[test]
    fn over_threshold_keeps_last_three_verbatim() {
        let limits = Limits::default();
        let big = "x".repeat(8_000);
        let records: Vec<_> = (1..=6).map(|index| record(index, big.clone())).collect();
        let text = compact_history(&records, &limits);
        // Oldest records shrink to one-liners; recent tail stays whole.
        assert!(text.contains("Iter 1: summary 1") || !text.contains("Iteration 1:"));
        assert!(text.contains("Iteration 6:"));
        assert!(estimate_tokens(&text) <= limits.history_token_budget);
    }

    #[test]
    fn never_exceeds_budget_even_with_huge_tail() {
        let limits = Limits::default();
        let huge = "y".repeat(200_000);
        let records: Vec<_> = (1..=4).map(|index| record(index, huge.clone())).collect();
        let text = compact_history(&records, &limits);
        assert!(estimate_tokens(&text) <= limits.history_token_budget);
    }

    #[test]
    fn single_large_iteration_triggers_compaction_early() {
        // One oversized record at iteration 4 would blow a count-based policy.
        let limits = Limits::default();
        let records = vec![
            record(1, "a".repeat(10_000)),
            record(2, "b".repeat(10_000)),
            record(3, "c".repeat(10_000)),
            record(4, "d".repeat(10_000)),
        ];
        let text = compact_history(&records, &limits);
        assert!(estimate_tokens(&text) <= limits.history_token_budget);
    }

    #[test]
    fn empty_history_is_empty() {
        assert!(compact_history(&[], &Limits::default()).is_empty());
    }
}
