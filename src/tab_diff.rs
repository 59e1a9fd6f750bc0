//! Snapshot/diff of tab state between iterations.
//!
//! Only url, title and status participate; tab creation and closure are not
//! page changes and tabs present on one side only are ignored.

use std::collections::BTreeMap;

use rlm_core_types::{PageChange, TabField, TabId, TabInfo, TabStatus};

#[derive(Debug, Clone, PartialEq)]
struct TabFacts {
    url: String,
    title: String,
    status: TabStatus,
}

/// Point-in-time capture of every tab's observable page state.
#[derive(Debug, Clone, Default)]
pub struct TabSnapshot {
    tabs: BTreeMap<TabId, TabFacts>,
}

impl TabSnapshot {
    pub fn capture(tabs: &[TabInfo]) -> Self {
        Self {
            tabs: tabs
                .iter()
                .map(|tab| {
                    (
                        tab.id.clone(),
                        TabFacts {
                            url: tab.url.clone(),
                            title: tab.title.clone(),
                            status: tab.status,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.keys().cloned().collect()
    }

    /// Changes from `self` (older) to `current` (newer), in tab order.
    pub fn diff(&self, current: &TabSnapshot) -> Vec<PageChange> {
        let mut changes = Vec::new();
        for (id, new_facts) in &current.tabs {
            let Some(old_facts) = self.tabs.get(id) else {
                continue;
            };
            if old_facts.url != new_facts.url {
                changes.push(PageChange {
                    tab_id: id.clone(),
                    field: TabField::Url,
                    old: old_facts.url.clone(),
                    new: new_facts.url.clone(),
                });
            }
            if old_facts.title != new_facts.title {
                changes.push(PageChange {
                    tab_id: id.clone(),
                    field: TabField::Title,
                    old: old_facts.title.clone(),
                    new: new_facts.title.clone(),
                });
            }
            if old_facts.status != new_facts.status {
                changes.push(PageChange {
                    tab_id: id.clone(),
                    field: TabField::Status,
                    old: old_facts.status.to_string(),
                    new: new_facts.status.to_string(),
                });
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: &str, url: &str, title: &str, status: TabStatus) -> TabInfo {
        TabInfo {
            id: TabId(id.to_string()),
            url: url.to_string(),
            title: title.to_string(),
            status,
            favicon: None,
        }
    }

    #[test]
    fn detects_field_level_changes() {
        let before = TabSnapshot::capture(&[tab("a", "u1", "t1", TabStatus::Loading)]);
        let after = TabSnapshot::capture(&[tab("a", "u2", "t1", TabStatus::Complete)]);
        let changes = before.diff(&after);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, TabField::Url);
        assert_eq!(changes[0].old, "u1");
        assert_eq!(changes[0].new, "u2");
        assert_eq!(changes[1].field, TabField::Status);
    }

    #[test]
    fn created_and_closed_tabs_are_not_changes() {
        let before = TabSnapshot::capture(&[tab("a", "u", "t", TabStatus::Complete)]);
        let after = TabSnapshot::capture(&[tab("b", "u", "t", TabStatus::Complete)]);
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let tabs = [tab("a", "u", "t", TabStatus::Complete)];
        let before = TabSnapshot::capture(&tabs);
        let after = TabSnapshot::capture(&tabs);
        assert!(before.diff(&after).is_empty());
    }
}
