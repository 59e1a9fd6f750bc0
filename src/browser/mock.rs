//! In-memory tab driver used by tests and the CLI demo mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use rlm_core_types::{TabId, TabInfo, TabStatus};

use super::{BrowserDriver, DriverError};

type ExecHandler = dyn Fn(&TabId, &str) -> Result<Value, DriverError> + Send + Sync;

#[derive(Default)]
struct MockState {
    tabs: BTreeMap<TabId, TabInfo>,
    order: Vec<TabId>,
    active: Option<TabId>,
    opened: u64,
}

/// Deterministic driver holding tab state in memory.
///
/// `exec` answers from a pluggable handler so scenario tests can script page
/// behavior; the default handler returns `null` for any script.
pub struct MockBrowserDriver {
    state: Mutex<MockState>,
    exec_handler: Mutex<Option<Arc<ExecHandler>>>,
}

impl Default for MockBrowserDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowserDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            exec_handler: Mutex::new(None),
        }
    }

    /// Start with one blank tab, mirroring a fresh browser window.
    pub fn with_blank_tab() -> Arc<Self> {
        let driver = Arc::new(Self::new());
        {
            let mut state = driver.state.lock();
            let id = TabId::new();
            state.tabs.insert(
                id.clone(),
                TabInfo {
                    id: id.clone(),
                    url: "about:blank".to_string(),
                    title: "New Tab".to_string(),
                    status: TabStatus::Complete,
                    favicon: None,
                },
            );
            state.order.push(id.clone());
            state.active = Some(id);
        }
        driver
    }

    /// Install a scripted `exec` handler.
    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&TabId, &str) -> Result<Value, DriverError> + Send + Sync + 'static,
    {
        *self.exec_handler.lock() = Some(Arc::new(handler));
    }

    /// Mutate a tab's visible page state, as a navigation or script would.
    pub fn set_page(&self, tab: &TabId, url: &str, title: &str, status: TabStatus) {
        let mut state = self.state.lock();
        if let Some(info) = state.tabs.get_mut(tab) {
            info.url = url.to_string();
            info.title = title.to_string();
            info.status = status;
        }
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().tabs.len()
    }

    pub fn opened_count(&self) -> u64 {
        self.state.lock().opened
    }

    fn derive_title(url: &str) -> String {
        url.trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or("page")
            .to_string()
    }
}

#[async_trait]
impl BrowserDriver for MockBrowserDriver {
    async fn exec(&self, tab: &TabId, code: &str) -> Result<Value, DriverError> {
        if !self.state.lock().tabs.contains_key(tab) {
            return Err(DriverError::NoSuchTab(tab.clone()));
        }
        let handler = self.exec_handler.lock().clone();
        match handler {
            Some(handler) => handler(tab, code),
            None => Ok(Value::Null),
        }
    }

    async fn open_tab(&self, url: Option<&str>) -> Result<TabId, DriverError> {
        let mut state = self.state.lock();
        let id = TabId::new();
        let url = url.unwrap_or("about:blank");
        state.tabs.insert(
            id.clone(),
            TabInfo {
                id: id.clone(),
                url: url.to_string(),
                title: Self::derive_title(url),
                status: TabStatus::Complete,
                favicon: None,
            },
        );
        state.order.push(id.clone());
        state.active = Some(id.clone());
        state.opened += 1;
        Ok(id)
    }

    async fn close_tab(&self, tab: &TabId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.tabs.remove(tab).is_none() {
            return Err(DriverError::NoSuchTab(tab.clone()));
        }
        state.order.retain(|id| id != tab);
        if state.active.as_ref() == Some(tab) {
            state.active = state.order.last().cloned();
        }
        Ok(())
    }

    async fn navigate(&self, tab: &TabId, url: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let title = Self::derive_title(url);
        match state.tabs.get_mut(tab) {
            Some(info) => {
                info.url = url.to_string();
                info.title = title;
                info.status = TabStatus::Complete;
                Ok(())
            }
            None => Err(DriverError::NoSuchTab(tab.clone())),
        }
    }

    async fn switch_tab(&self, tab: &TabId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if !state.tabs.contains_key(tab) {
            return Err(DriverError::NoSuchTab(tab.clone()));
        }
        state.active = Some(tab.clone());
        Ok(())
    }

    async fn wait_for_load(&self, tab: &TabId, _timeout_ms: u64) -> Result<(), DriverError> {
        if self.state.lock().tabs.contains_key(tab) {
            Ok(())
        } else {
            Err(DriverError::NoSuchTab(tab.clone()))
        }
    }

    async fn wait_for_selector(
        &self,
        tab: &TabId,
        selector: &str,
        _timeout_ms: u64,
    ) -> Result<(), DriverError> {
        if self.state.lock().tabs.contains_key(tab) {
            let _ = selector;
            Ok(())
        } else {
            Err(DriverError::NoSuchTab(tab.clone()))
        }
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, DriverError> {
        let state = self.state.lock();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.tabs.get(id).cloned())
            .collect())
    }

    async fn active_tab_id(&self) -> Result<Option<TabId>, DriverError> {
        Ok(self.state.lock().active.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_navigate_close_roundtrip() {
        let driver = MockBrowserDriver::new();
        let tab = driver.open_tab(Some("https://example.com")).await.unwrap();
        assert_eq!(driver.active_tab_id().await.unwrap(), Some(tab.clone()));

        driver
            .navigate(&tab, "https://example.com/page")
            .await
            .unwrap();
        let tabs = driver.list_tabs().await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].url, "https://example.com/page");

        driver.close_tab(&tab).await.unwrap();
        assert!(driver.list_tabs().await.unwrap().is_empty());
        assert_eq!(driver.active_tab_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn exec_uses_scripted_handler() {
        let driver = MockBrowserDriver::new();
        let tab = driver.open_tab(None).await.unwrap();
        driver.set_exec_handler(|_, code| {
            if code.contains("document.title") {
                Ok(Value::String("Mock Title".into()))
            } else {
                Ok(Value::Null)
            }
        });
        let value = driver.exec(&tab, "document.title").await.unwrap();
        assert_eq!(value, Value::String("Mock Title".into()));
    }

    #[tokio::test]
    async fn exec_on_missing_tab_fails() {
        let driver = MockBrowserDriver::new();
        let missing = TabId::new();
        assert!(matches!(
            driver.exec(&missing, "1").await,
            Err(DriverError::NoSuchTab(_))
        ));
    }
}
