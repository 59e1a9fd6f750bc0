//! Browser driver contract consumed by the engine.
//!
//! The concrete tab driver lives outside this crate; the engine only depends
//! on this narrow async interface. The in-memory [`MockBrowserDriver`] backs
//! tests and the CLI demo mode.

mod mock;

pub use mock::MockBrowserDriver;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use rlm_core_types::{TabId, TabInfo};

/// Failures reported by the tab driver.
#[derive(Debug, Error, Clone)]
pub enum DriverError {
    #[error("no such tab: {0}")]
    NoSuchTab(TabId),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// Script raised inside the tab's renderer context.
    #[error("script error: {0}")]
    Script(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Contract for the external tab driver.
///
/// `exec` runs code in the tab's renderer context and must return a
/// JSON-serializable value; everything richer the REPL offers (`getText`,
/// `getLinks`, click/type/scroll) is composed on top of `exec` by the
/// sandbox, keeping this surface minimal.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn exec(&self, tab: &TabId, code: &str) -> Result<Value, DriverError>;

    async fn open_tab(&self, url: Option<&str>) -> Result<TabId, DriverError>;
    async fn close_tab(&self, tab: &TabId) -> Result<(), DriverError>;
    async fn navigate(&self, tab: &TabId, url: &str) -> Result<(), DriverError>;
    async fn switch_tab(&self, tab: &TabId) -> Result<(), DriverError>;

    async fn wait_for_load(&self, tab: &TabId, timeout_ms: u64) -> Result<(), DriverError>;
    async fn wait_for_selector(
        &self,
        tab: &TabId,
        selector: &str,
        timeout_ms: u64,
    ) -> Result<(), DriverError>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, DriverError>;
    async fn active_tab_id(&self) -> Result<Option<TabId>, DriverError>;
}
