//! Shared identifier and tab state types for the RLM engine workspace.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub String);

impl TabId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a host-parsed document inside one REPL session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DocHandle(pub u64);

impl fmt::Display for DocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc:{}", self.0)
    }
}

/// Load status of a browser tab as reported by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabStatus {
    Loading,
    Complete,
    Error,
}

impl fmt::Display for TabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabStatus::Loading => f.write_str("loading"),
            TabStatus::Complete => f.write_str("complete"),
            TabStatus::Error => f.write_str("error"),
        }
    }
}

/// Driver-reported description of one tab.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    pub title: String,
    pub status: TabStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

/// Field of a tab that changed between two snapshots.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabField {
    Url,
    Title,
    Status,
}

impl fmt::Display for TabField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabField::Url => f.write_str("url"),
            TabField::Title => f.write_str("title"),
            TabField::Status => f.write_str("status"),
        }
    }
}

/// One observed change on a tab between two snapshot points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageChange {
    #[serde(rename = "tabId")]
    pub tab_id: TabId,
    pub field: TabField,
    pub old: String,
    pub new: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_ids_are_unique() {
        assert_ne!(TabId::new(), TabId::new());
    }

    #[test]
    fn doc_handles_display_with_prefix() {
        assert_eq!(DocHandle(3).to_string(), "doc:3");
        assert_eq!(DocHandle(3), DocHandle(3));
    }

    #[test]
    fn page_change_serializes_with_camel_case_tab_id() {
        let change = PageChange {
            tab_id: TabId("t-1".into()),
            field: TabField::Url,
            old: "about:blank".into(),
            new: "https://example.com".into(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["tabId"], "t-1");
        assert_eq!(json["field"], "url");
    }
}
